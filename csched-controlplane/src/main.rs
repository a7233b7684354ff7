use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use csched_catalog::load_catalog;
use csched_controlplane::{router, ControlPlaneState};
use csched_core::{CycleConfig, PlanningCycle};
use csched_deploy::{Deployer, JsonRpcDeployer};
use csched_dispatcher::Dispatcher;
use csched_forecast::{FetchMode, HttpForecastProvider};
use csched_queue::HttpQueueAdapter;
use csched_registry::HttpNormalizationOracle;
use csched_store::{FsObjectStore, ObjectStore};
use csched_telemetry::TelemetryLog;
use csched_types::BackoffPolicy;
use tokio::sync::Mutex;

struct Config {
    store_root: String,
    planning_region: String,
    forecast_url: String,
    forecast_token: String,
    forecast_mode: FetchMode,
    oracle_url: String,
    oracle_token: String,
    deployer_url: String,
    deployer_token: String,
    queue_url: String,
    queue_token: String,
    telemetry_file: String,
    addr: SocketAddr,
}

fn require_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{key} is required"))
}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        let forecast_mode = match std::env::var("CSCHED_FORECAST_MODE").as_deref() {
            Ok("historical") => FetchMode::Historical,
            Ok("forecast") | Err(_) => FetchMode::Forecast,
            Ok(other) => anyhow::bail!("CSCHED_FORECAST_MODE must be forecast|historical, got {other}"),
        };
        Ok(Self {
            store_root: require_env("CSCHED_STORE_ROOT")?,
            planning_region: require_env("CSCHED_PLANNING_REGION")?,
            forecast_url: require_env("CSCHED_FORECAST_URL")?,
            forecast_token: require_env("CSCHED_FORECAST_TOKEN")?,
            forecast_mode,
            oracle_url: require_env("CSCHED_ORACLE_URL")?,
            oracle_token: require_env("CSCHED_ORACLE_TOKEN")?,
            deployer_url: require_env("CSCHED_DEPLOYER_URL")?,
            deployer_token: require_env("CSCHED_DEPLOYER_TOKEN")?,
            queue_url: require_env("CSCHED_QUEUE_URL")?,
            queue_token: require_env("CSCHED_QUEUE_TOKEN")?,
            telemetry_file: std::env::var("CSCHED_TELEMETRY_FILE").unwrap_or_else(|_| "./telemetry.jsonl".into()),
            addr: std::env::var("CSCHED_CONTROLPLANE_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8081".into())
                .parse()?,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.store_root));
    // Fatal at startup if the catalog can't be loaded (spec §4.1, §7).
    let catalog = Arc::new(load_catalog(store.as_ref()).await?);

    let telemetry = Arc::new(TelemetryLog::open(&config.telemetry_file)?);
    let deployer: Arc<dyn Deployer> = Arc::new(JsonRpcDeployer::new(config.deployer_url, config.deployer_token));
    let queue = Arc::new(HttpQueueAdapter::new(config.queue_url, config.queue_token));

    let cycle = Arc::new(PlanningCycle {
        store: store.clone(),
        catalog: catalog.clone(),
        normalization_oracle: Arc::new(HttpNormalizationOracle::new(config.oracle_url, config.oracle_token)),
        ranking_oracle: None,
        forecast_provider: Arc::new(HttpForecastProvider::new(config.forecast_url, config.forecast_token)),
        forecast_mode: config.forecast_mode,
        deployer: Arc::clone(&deployer),
        telemetry: Some(Arc::clone(&telemetry)),
        config: CycleConfig {
            cycle_deadline: StdDuration::from_secs(4 * 60),
            backoff: BackoffPolicy::default(),
            ..CycleConfig::default()
        },
    });

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        queue,
        Some(telemetry),
        BackoffPolicy::default(),
    ));

    let state = ControlPlaneState {
        store,
        catalog,
        cycle,
        dispatcher,
        deployer,
        planning_region: config.planning_region,
        last_cycle: Arc::new(Mutex::new(None)),
    };

    let app = router(state);

    tracing::info!(addr = %config.addr, "control plane listening");
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
