mod config;

use clap::{Parser, Subcommand};
use config::{CommonConfig, Config, ConfigError};
use importer::ImporterError;
use importer::errors::JobError;
use importer::metrics_defs::ALL_METRICS;
use importer::orchestrator::StartImportRequest;
use importer::store::MemoryDatastore;
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const METRICS_PREFIX: &str = "fleetimport";

#[derive(Parser)]
#[command(version, about = "Bulk account and vehicle import")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the job API and admin listeners
    Serve {
        #[arg(long)]
        config: PathBuf,
    },
    /// Import the given usernames once and print the final job record
    Import {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value = "cli import")]
        job_name: String,
        #[arg(required = true)]
        usernames: Vec<String>,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Importer(#[from] ImporterError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not encode job record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("import task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn main() {
    let cli = Cli::parse();
    let config_path = match &cli.command {
        CliCommand::Serve { config } | CliCommand::Import { config, .. } => config,
    };

    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let _sentry = init_logging(&config.common);
    if let Err(e) = init_metrics(&config.common) {
        tracing::error!(error = %e, "metrics disabled");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "could not start runtime");
            process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            CliCommand::Serve { .. } => {
                tracing::info!("starting fleetimport");
                importer::run(config.importer).await.map_err(CliError::from)
            }
            CliCommand::Import {
                job_name,
                usernames,
                ..
            } => import_once(config, job_name, usernames).await,
        }
    });

    if let Err(e) = result {
        tracing::error!(error = %e, "fleetimport failed");
        process::exit(1);
    }
}

/// Installs the fmt subscriber, plus the sentry layer when a DSN is configured.
/// The returned guard flushes sentry on drop.
fn init_logging(common: &CommonConfig) -> Option<sentry::ClientInitGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&common.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let guard = common.logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();
    guard
}

fn init_metrics(common: &CommonConfig) -> Result<(), CliError> {
    let Some(metrics_config) = &common.metrics else {
        return Ok(());
    };

    let recorder = StatsdBuilder::from(metrics_config.statsd_host.as_str(), metrics_config.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;
    shared::metrics_defs::describe_all(ALL_METRICS);

    tracing::info!(
        host = %metrics_config.statsd_host,
        port = metrics_config.statsd_port,
        "statsd metrics enabled"
    );
    Ok(())
}

async fn import_once(
    config: Config,
    job_name: String,
    usernames: Vec<String>,
) -> Result<(), CliError> {
    config.importer.validate().map_err(ImporterError::from)?;
    let orchestrator =
        importer::build_orchestrator(&config.importer, Arc::new(MemoryDatastore::new()))?;

    let (started, handle) = orchestrator
        .start_job(StartImportRequest {
            job_name,
            target_usernames: Some(usernames),
            approved_preview_ids: None,
        })
        .await?;
    tracing::info!(job_id = %started.job_id, "{}", started.message);

    handle.await?;
    let job = orchestrator.get_job(started.job_id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}
