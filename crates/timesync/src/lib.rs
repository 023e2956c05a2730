//! sensorhub-timesync: Disciplined time source
//!
//! [`ClockSync`] keeps the offset between the local wall clock and an external
//! reference in an atomic, so `now()` is a clock read plus an add. The offset
//! is refreshed in the background from a [`TimeReference`] (SNTP by default).

pub mod clock;
pub mod error;
pub mod reference;
pub mod sntp;

pub use clock::{local_nanos, ClockStatus, ClockSync};
pub use error::ClockError;
pub use reference::{OffsetSample, TimeReference};
pub use sntp::SntpReference;
