//! Operator CLI: local subcommands over a filesystem-backed store directory
//! without standing up the dispatcher/control-plane HTTP services, plus
//! telemetry tail/verify.

use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use csched_catalog::load_catalog;
use csched_core::{CycleConfig, PlanningCycle};
use csched_deploy::NullDeployer;
use csched_forecast::{FetchMode, StoreSnapshotForecastProvider};
use csched_registry::NullOracle;
use csched_store::{FsObjectStore, ObjectStore};
use csched_telemetry::TelemetryLog;

#[derive(Parser)]
#[command(name = "csched")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a one-off planning cycle against a local store directory.
    /// Requires `static_config.json`, `function_metadata.json`, and
    /// (for any function that isn't already a cache hit)
    /// `carbon_forecasts.json` to already exist under `--store`.
    Plan {
        #[arg(long)]
        store: String,
        #[arg(long, default_value = "adhoc")]
        scenario: String,
        #[arg(long, default_value = "./telemetry.jsonl")]
        telemetry: String,
    },
    /// Print the cached schedule for one function, if any.
    Schedule {
        #[arg(long)]
        store: String,
        #[arg(long)]
        function_id: String,
    },
    Telemetry {
        #[command(subcommand)]
        action: TelemetryCommand,
        #[arg(long, default_value = "./telemetry.jsonl")]
        path: String,
    },
}

#[derive(Subcommand)]
enum TelemetryCommand {
    Tail {
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
    Verify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Plan {
            store,
            scenario,
            telemetry,
        } => run_plan(store, scenario, telemetry).await,
        Command::Schedule { store, function_id } => show_schedule(store, function_id).await,
        Command::Telemetry { action, path } => match action {
            TelemetryCommand::Tail { lines } => {
                let log = TelemetryLog::open(&path)?;
                for event in log.tail(lines)? {
                    println!("{}", serde_json::to_string(&event)?);
                }
                Ok(())
            }
            TelemetryCommand::Verify => {
                csched_telemetry::verify(&path)?;
                println!("telemetry log ok");
                Ok(())
            }
        },
    }
}

async fn run_plan(store_root: String, scenario: String, telemetry_path: String) -> anyhow::Result<()> {
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(store_root));
    let catalog = Arc::new(load_catalog(store.as_ref()).await?);
    let forecast_provider = match StoreSnapshotForecastProvider::load(store.as_ref()).await {
        Ok(p) => Arc::new(p),
        Err(e) => {
            tracing::warn!(error = %e, "no carbon_forecasts.json snapshot found; only cache hits will produce a schedule");
            Arc::new(StoreSnapshotForecastProvider::empty())
        }
    };
    let telemetry = Arc::new(TelemetryLog::open(&telemetry_path)?);

    let cycle = PlanningCycle {
        store: store.clone(),
        catalog,
        normalization_oracle: Arc::new(NullOracle),
        ranking_oracle: None,
        forecast_provider,
        forecast_mode: FetchMode::Forecast,
        deployer: Arc::new(NullDeployer),
        telemetry: Some(telemetry),
        config: CycleConfig::default(),
    };

    let summary = cycle.run(&scenario, Utc::now()).await?;
    csched_core::persist_written_schedules(store.as_ref(), &summary.outcomes).await?;

    for outcome in &summary.outcomes {
        println!("{}: {:?}", outcome.function_id, outcome.status);
        if let Some(schedule) = &outcome.schedule {
            for rec in schedule.ranked().into_iter().take(5) {
                println!(
                    "  #{:<2} {:<12} {}  ci={:.1}  cost=${:.4}",
                    rec.priority, rec.region, rec.hour_start_utc, rec.carbon_intensity_g_per_kwh, rec.transfer_cost_usd
                );
            }
        }
    }
    for rejected in &summary.rejected {
        println!("{}: REJECTED ({})", rejected.function_id, rejected.reason);
    }
    Ok(())
}

async fn show_schedule(store_root: String, function_id: String) -> anyhow::Result<()> {
    let store = FsObjectStore::new(store_root);
    let key = csched_cache::schedule_key(&function_id);
    let bytes = store.get(&key).await?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
