//! Simulated producers for exercising a hub

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sensorhub_client::ReconnectingProducer;
use sensorhub_protocol::SensorType;

#[derive(Parser, Debug)]
#[command(name = "sensorhub-sim")]
#[command(about = "Stream synthetic sensor samples to a sensorhub")]
struct Args {
    /// Hub ingest address
    #[arg(long, env = "HUB_ADDR", default_value = "127.0.0.1:5555")]
    hub: String,

    /// Sensor types to simulate, one producer each
    #[arg(long, value_delimiter = ',', default_value = "FSR,ACCELEROMETER,MICROPHONE")]
    sensors: Vec<String>,

    /// Samples per second per producer
    #[arg(long, default_value_t = 50.0)]
    rate: f64,

    /// Stop after this many seconds (runs until ctrl-c when unset)
    #[arg(long)]
    duration: Option<u64>,

    /// Frames buffered while disconnected
    #[arg(long, default_value_t = 1000)]
    outbox: usize,

    /// Wait between reconnect attempts, in milliseconds
    #[arg(long, default_value_t = 5000)]
    backoff_ms: u64,
}

fn synthesize(sensor: &SensorType, rng: &mut impl Rng, tick: u64) -> Map<String, Value> {
    let value = match sensor {
        SensorType::Fsr => {
            let raw: u64 = rng.random_range(0..4096);
            json!({"force": raw as f64 * 0.01, "raw": raw})
        }
        SensorType::Accelerometer => json!({
            "x": rng.random_range(-0.5..0.5),
            "y": rng.random_range(-0.5..0.5),
            "z": 9.81 + rng.random_range(-0.1..0.1),
        }),
        SensorType::Microphone => json!({
            "rms_left": rng.random_range(0.0..0.3),
            "rms_right": rng.random_range(0.0..0.3),
        }),
        SensorType::Generic(_) => json!({"value": rng.random_range(0.0..1.0), "tick": tick}),
    };
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn generate(producer: Arc<ReconnectingProducer>, rate: f64, cancel: CancellationToken) {
    let mut ticker = interval(Duration::from_secs_f64(1.0 / rate));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let fields = synthesize(producer.sensor(), &mut rand::rng(), tick);
                producer.submit(fields);
                tick += 1;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if !(args.rate > 0.0 && args.rate.is_finite()) {
        return Err(format!("rate must be positive, got {}", args.rate).into());
    }

    let cancel = CancellationToken::new();
    let tasks = TaskTracker::new();
    let mut producers = Vec::new();

    for name in &args.sensors {
        let sensor = SensorType::from_token(name)?;
        let producer = Arc::new(ReconnectingProducer::new(
            args.hub.clone(),
            sensor,
            args.outbox,
            Duration::from_millis(args.backoff_ms),
        ));
        info!(sensor = %producer.sensor(), hub = %args.hub, rate = args.rate, "Starting producer");

        let runner = Arc::clone(&producer);
        let token = cancel.clone();
        tasks.spawn(async move { runner.run(token).await });
        tasks.spawn(generate(Arc::clone(&producer), args.rate, cancel.clone()));
        producers.push(producer);
    }
    tasks.close();

    match args.duration {
        Some(secs) => tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => info!(secs, "Duration reached"),
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("ctrl-c received");
            }
        },
        None => {
            tokio::signal::ctrl_c().await?;
            info!("ctrl-c received");
        }
    }

    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(5), tasks.wait())
        .await
        .is_err()
    {
        warn!("Producers did not stop within 5s");
    }

    for producer in &producers {
        info!(
            sensor = %producer.sensor(),
            sent = producer.sent(),
            dropped = producer.dropped(),
            "Statistics"
        );
    }
    Ok(())
}
