//! sensorhub binary entry point

mod shutdown;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sensorhub_hub::{run_server, Hub, HubConfig};

#[derive(Parser, Debug)]
#[command(name = "sensorhub")]
#[command(about = "Collects sensor samples over TCP and records them per session")]
struct Args {
    /// Path to hub configuration file (YAML). Defaults apply without one.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP address producers connect to
    #[arg(long, env = "HUB_BIND")]
    bind: Option<SocketAddr>,

    /// Root directory for session folders
    #[arg(long, env = "HUB_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Address of the status/control/metrics HTTP server
    #[arg(long, env = "HUB_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// SNTP server used as time reference
    #[arg(long, env = "HUB_NTP_SERVER")]
    ntp_server: Option<String>,

    /// Run on the local clock without querying a time reference
    #[arg(long)]
    no_ntp: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut HubConfig) {
        if let Some(bind) = self.bind {
            config.listener.bind = bind;
        }
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = dir.clone();
        }
        if let Some(addr) = self.http_addr {
            config.http.bind = addr;
        }
        if let Some(server) = &self.ntp_server {
            config.clock.server = server.clone();
        }
        if self.no_ntp {
            config.clock.enabled = false;
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let (json_layer, text_layer) = if json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = match &args.config {
        Some(path) => HubConfig::load(path).map_err(|e| {
            error!(error = %e, path = ?path, "Failed to load config");
            e
        })?,
        None => HubConfig::default(),
    };
    args.apply(&mut config);

    info!(
        bind = %config.listener.bind,
        http = %config.http.bind,
        data_dir = ?config.storage.data_dir,
        ntp = config.clock.enabled,
        ntp_server = %config.clock.server,
        "Starting sensorhub"
    );

    let grace = config.shutdown.grace_period;
    let http_addr = config.http.bind;
    let hub = Hub::start(config).await.map_err(|e| {
        error!(error = %e, "Failed to start hub");
        e
    })?;

    let mut http = tokio::spawn(run_server(http_addr, hub.state(), hub.cancel_token()));

    info!("Hub running, waiting for SIGTERM/SIGINT to stop");
    let mut server_error = None;
    tokio::select! {
        result = shutdown::shutdown_signal() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signals");
            }
        }
        result = &mut http => {
            match result {
                Ok(Ok(())) => warn!("HTTP server exited unexpectedly"),
                Ok(Err(e)) => {
                    error!(error = %e, addr = %http_addr, "HTTP server failed");
                    server_error = Some(e);
                }
                Err(e) => error!(error = %e, "HTTP server task panicked"),
            }
        }
    }

    shutdown::exit_on_second_signal();
    let report = hub.shutdown(grace).await;
    if report.readers_abandoned || report.writers_abandoned {
        warn!(?report, "Shutdown grace period exceeded");
    }

    if !http.is_finished() {
        let _ = tokio::time::timeout(grace, &mut http).await;
    }

    info!("sensorhub stopped");
    match server_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
