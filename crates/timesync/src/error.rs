use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClockError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not resolve reference {0}")]
    Resolve(String),
    #[error("reference did not answer within {0:?}")]
    Timeout(Duration),
    #[error("invalid reference response: {0}")]
    InvalidResponse(String),
    #[error("reference refused service (kiss code {0})")]
    KissOfDeath(String),
}
