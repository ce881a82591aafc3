pub mod api;
pub mod audit;
pub mod config;
pub mod errors;
pub mod http_rate_limit;
pub mod job_status;
pub mod metrics_defs;
pub mod monitoring;
pub mod orchestrator;
pub mod parallel;
pub mod provider;
pub mod provisioner;
pub mod rate_limiter;
pub mod retry;
pub mod store;
pub mod transaction;
pub mod types;
pub mod validation;
pub mod vehicles;

#[cfg(test)]
mod testutils;

use crate::config::{Config, Listener, ValidationError};
use crate::http_rate_limit::SlidingWindowLimiter;
use crate::orchestrator::{Orchestrator, OrchestratorSettings, StaticApprovals};
use crate::provider::{HttpProvider, ProviderError};
use crate::store::{Datastore, MemoryDatastore};
use axum::Router;
use shared::admin_service::{AdminService, Readiness};
use shared::http::run_http_service;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum ImporterError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),
    #[error("could not build provider client: {0}")]
    Provider(#[from] ProviderError),
}

/// Wires the provider client and approvals from `config` to `store`.
pub fn build_orchestrator(
    config: &Config,
    store: Arc<dyn Datastore>,
) -> Result<Orchestrator, ImporterError> {
    let provider = HttpProvider::new(
        &config.provider.url,
        &config.provider.admin_token,
        config.provider.timeout(),
    )?;
    let approvals = StaticApprovals::new(config.approved_previews.clone());

    Ok(Orchestrator::new(
        store,
        Arc::new(provider),
        Arc::new(approvals),
        OrchestratorSettings::from_config(config),
    ))
}

/// Serves the job API and the admin listener until one of them fails.
pub async fn run(config: Config) -> Result<(), ImporterError> {
    config.validate()?;

    let readiness = Readiness::new();
    let orchestrator = build_orchestrator(&config, Arc::new(MemoryDatastore::new()))?;
    let limiter = SlidingWindowLimiter::new(
        config.http_rate_limit.requests,
        Duration::from_secs(config.http_rate_limit.window_secs),
    );

    let api_task = serve_api(
        &config.listener,
        api::router(orchestrator, limiter),
        readiness.clone(),
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::<ImporterError>::new(readiness),
    );

    tokio::try_join!(api_task, admin_task)?;
    Ok(())
}

async fn serve_api(
    listener: &Listener,
    app: Router,
    readiness: Readiness,
) -> Result<(), ImporterError> {
    let addr = format!("{}:{}", listener.host, listener.port);
    let tcp_listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "job api listening");

    readiness.mark_ready();
    let result = axum::serve(tcp_listener, app).await;
    readiness.mark_not_ready();
    Ok(result?)
}
