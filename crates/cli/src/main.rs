use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ferry_apply::UpsertApplier;
use ferry_core::config::{validate_runner, DEFAULT_RUNNER};
use ferry_core::{
    LookupRequest, MarkerWriter, ResourceType, ScopeKey, SourceQuery, SyncConfig, Watermark, WatermarkStorage,
};
use ferry_hub::MemoryProject;
use ferry_persist::SqliteWatermarkStore;
use ferry_sync::{Collaborators, DriverReport, Outcome, Selection, SyncDriver};
use serde_json::json;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ferryctl", version, about = "Copy resources between commerce projects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

/// Where watermarks are kept.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Watermarks {
    /// Local SQLite database (FERRY_DB_PATH)
    Sqlite,
    /// Custom objects in the target project
    Target,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync one resource type, or `all` in dependency order
    Sync {
        /// Resource type (e.g. products, productTypes) or "all"
        resource: String,
        /// Runner name scoping the watermarks
        #[arg(long = "runner")]
        runner: Option<String>,
        /// Ignore the stored watermark and sync everything
        #[arg(long = "full")]
        full: bool,
        /// Source project snapshot (JSON)
        #[arg(long = "source")]
        source: PathBuf,
        /// Target project snapshot (JSON); created when missing
        #[arg(long = "target")]
        target: PathBuf,
        #[arg(long = "watermarks", value_enum, default_value_t = Watermarks::Sqlite)]
        watermarks: Watermarks,
    },
    /// Print the stored watermark of one scope
    Watermark {
        resource: String,
        #[arg(long = "runner")]
        runner: Option<String>,
        #[arg(long = "watermarks", value_enum, default_value_t = Watermarks::Sqlite)]
        watermarks: Watermarks,
        /// Target project snapshot; required with `--watermarks target`
        #[arg(long = "target")]
        target: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("FERRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FERRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FERRY_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_target(path: &Path, application: &str) -> Result<MemoryProject> {
    let project = if path.exists() { MemoryProject::load(path)? } else { MemoryProject::new("target") };
    Ok(project.with_application(application))
}

fn watermark_store(kind: Watermarks, target: Option<&Arc<MemoryProject>>) -> Result<Arc<dyn WatermarkStorage>> {
    match (kind, target) {
        (Watermarks::Sqlite, _) => Ok(Arc::new(SqliteWatermarkStore::open_default()?)),
        (Watermarks::Target, Some(t)) => Ok(Arc::clone(t) as Arc<dyn WatermarkStorage>),
        (Watermarks::Target, None) => Err(anyhow!("--watermarks target needs --target")),
    }
}

fn watermark_json(w: &Watermark) -> serde_json::Value {
    serde_json::to_value(w).unwrap_or(serde_json::Value::Null)
}

fn print_report(report: &DriverReport, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for (rt, outcome) in &report.outcomes {
                match outcome {
                    Outcome::Succeeded(s) => println!(
                        "{} • ok • {} created, {} updated, {} failed • {} ms",
                        rt,
                        s.statistics.created,
                        s.statistics.updated,
                        s.statistics.failed,
                        s.elapsed.as_millis()
                    ),
                    Outcome::Failed(e) => println!("{} • FAILED during {} • {:#}", rt, e.phase, e.source),
                    Outcome::Skipped => println!("{} • skipped", rt),
                }
            }
        }
        Output::Json => {
            let rows: Vec<serde_json::Value> = report
                .outcomes
                .iter()
                .map(|(rt, outcome)| match outcome {
                    Outcome::Succeeded(s) => json!({
                        "resource": rt.as_str(),
                        "status": "succeeded",
                        "runner": s.runner,
                        "window": s.predicate.to_where(),
                        "statistics": s.statistics,
                        "pages": s.pages,
                        "tookMs": s.elapsed.as_millis() as u64,
                        "watermark": s.watermark.as_ref().map(watermark_json),
                    }),
                    Outcome::Failed(e) => json!({
                        "resource": rt.as_str(),
                        "status": "failed",
                        "phase": e.phase.as_str(),
                        "error": format!("{:#}", e.source),
                    }),
                    Outcome::Skipped => json!({ "resource": rt.as_str(), "status": "skipped" }),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync { resource, runner, full, source, target, watermarks } => {
            let selection = Selection::from_str(&resource)?;
            if let Some(r) = runner.as_deref() {
                validate_runner(r)?;
            }
            let cfg = SyncConfig::from_env();
            let source_project = Arc::new(MemoryProject::load(&source)?);
            let target_project = Arc::new(load_target(&target, &cfg.application)?);
            let collab = Collaborators {
                source: Arc::clone(&source_project) as Arc<dyn SourceQuery>,
                lookup: Arc::clone(&source_project) as Arc<dyn LookupRequest>,
                marker: Arc::clone(&target_project) as Arc<dyn MarkerWriter>,
                watermarks: watermark_store(watermarks, Some(&target_project))?,
                apply: Arc::new(UpsertApplier::new(Arc::clone(&target_project))),
            };

            let (abort_tx, abort_rx) = watch::channel(false);
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current stage");
                    let _ = abort_tx.send(true);
                }
            });

            info!(resource = %resource, runner = ?runner, full, "sync invoked");
            let driver = SyncDriver::new(cfg, collab).with_abort(abort_rx);
            let report = driver.run(selection, runner.as_deref(), full).await;
            target_project.save(&target)?;
            print_report(&report, cli.output)?;
            if !report.is_success() {
                for e in report.failures() {
                    error!(resource = %e.resource, phase = %e.phase, error = %format!("{:#}", e.source), "sync failed");
                }
                std::process::exit(1);
            }
        }
        Commands::Watermark { resource, runner, watermarks, target } => {
            let rt = ResourceType::from_str(&resource)?;
            let runner = validate_runner(runner.as_deref().unwrap_or(DEFAULT_RUNNER))?;
            let cfg = SyncConfig::from_env();
            let target_project = match target.as_deref() {
                Some(p) => Some(Arc::new(load_target(p, &cfg.application)?)),
                None => None,
            };
            let store = watermark_store(watermarks, target_project.as_ref())?;
            let scope = ScopeKey::new(cfg.application, runner, rt);
            match (store.get(&scope).await?, cli.output) {
                (Some(w), Output::Json) => println!("{}", serde_json::to_string_pretty(&w)?),
                (Some(w), Output::Human) => println!(
                    "{} • last sync {} • {} • version {} • {} ms",
                    scope,
                    w.last_sync_timestamp.to_rfc3339(),
                    w.statistics.report(rt),
                    w.application_version,
                    w.last_sync_duration_millis
                ),
                (None, Output::Json) => println!("null"),
                (None, Output::Human) => println!("{} • no watermark (next delta run syncs everything)", scope),
            }
        }
    }
    Ok(())
}
