//! Drives an import job from request to final status.
//!
//! `start_job` does the synchronous part (request checks, job record,
//! username validation) and returns as soon as the job is `processing`. The
//! users are imported by a spawned task that feeds progress to the job record
//! through a channel, runs the consistency audit and writes the final summary.

use crate::audit::ConsistencyAuditor;
use crate::config::Config;
use crate::errors::{ImportError, JobError, JobResult};
use crate::job_status::{JobStatusManager, JobSummary};
use crate::metrics_defs::{JOBS_FINISHED, ROLLBACKS};
use crate::monitoring::ImportMonitor;
use crate::parallel::{ItemError, ParallelProcessor, ProcessingPlan};
use crate::provider::VehicleProvider;
use crate::provisioner::UserProvisioner;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::retry::RetryPolicy;
use crate::store::Datastore;
use crate::transaction::{TransactionLog, TransactionManager};
use crate::types::{ErrorKind, ErrorLogEntry, ImportJob, JobId, UserId, UserImportResult};
use crate::validation::DataValidator;
use crate::vehicles::VehicleStore;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::Serialize;
use shared::counter;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const PROGRESS_BUFFER: usize = 64;
/// Rough cost of one user, used only for the completion estimate.
const PER_USER_ESTIMATE: Duration = Duration::from_secs(2);

/// Resolves approved preview records to external usernames.
#[async_trait]
pub trait ApprovalLookup: Send + Sync {
    async fn resolve(&self, preview_ids: &[String]) -> JobResult<Vec<String>>;
}

/// Approvals known up front, e.g. from configuration.
#[derive(Default)]
pub struct StaticApprovals {
    previews: HashMap<String, String>,
}

impl StaticApprovals {
    pub fn new(previews: HashMap<String, String>) -> Self {
        StaticApprovals { previews }
    }
}

#[async_trait]
impl ApprovalLookup for StaticApprovals {
    async fn resolve(&self, preview_ids: &[String]) -> JobResult<Vec<String>> {
        preview_ids
            .iter()
            .map(|id| {
                self.previews
                    .get(id)
                    .cloned()
                    .ok_or_else(|| JobError::InvalidRequest(format!("unknown preview id {id:?}")))
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StartImportRequest {
    pub job_name: String,
    pub target_usernames: Option<Vec<String>>,
    pub approved_preview_ids: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobStarted {
    pub job_id: JobId,
    pub message: String,
    pub target_usernames: Vec<String>,
    pub estimated_completion: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    /// Replaces the workload-based limiter sizing.
    pub rate_limit: Option<RateLimiterConfig>,
    /// Replaces the size-based processing plan.
    pub plan: Option<ProcessingPlan>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        OrchestratorSettings {
            retry: config.retry.policy(),
            rate_limit: config.rate_limit.as_ref().map(|r| r.limiter_config()),
            plan: None,
        }
    }
}

fn estimate_duration(total: usize, plan: &ProcessingPlan) -> Duration {
    let batch_size = plan.batch_size.max(1);
    let concurrency = plan.max_concurrency.max(1);
    let batches = total.div_ceil(batch_size);
    let groups = batches.div_ceil(concurrency) as u32;
    let per_group = PER_USER_ESTIMATE * batch_size as u32;
    per_group * groups + plan.group_delay * groups.saturating_sub(1)
}

struct Inner {
    store: Arc<dyn Datastore>,
    provider: Arc<dyn VehicleProvider>,
    approvals: Arc<dyn ApprovalLookup>,
    jobs: Arc<JobStatusManager>,
    processor: ParallelProcessor,
    settings: OrchestratorSettings,
    running: Mutex<HashMap<JobId, CancellationToken>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Datastore>,
        provider: Arc<dyn VehicleProvider>,
        approvals: Arc<dyn ApprovalLookup>,
        settings: OrchestratorSettings,
    ) -> Self {
        let jobs = Arc::new(JobStatusManager::new(store.clone()));
        Orchestrator {
            inner: Arc::new(Inner {
                store,
                provider,
                approvals,
                jobs,
                processor: ParallelProcessor::new(),
                settings,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn get_job(&self, job_id: JobId) -> JobResult<ImportJob> {
        self.inner.jobs.get_job(job_id).await
    }

    pub async fn list_jobs(&self) -> JobResult<Vec<ImportJob>> {
        Ok(self.inner.store.list_jobs().await?)
    }

    /// Resolves the request to usernames. Nothing is persisted if this fails.
    async fn resolve_usernames(&self, request: &StartImportRequest) -> JobResult<Vec<String>> {
        if request.job_name.trim().is_empty() {
            return Err(JobError::InvalidRequest("job name is required".into()));
        }

        let usernames = match (&request.target_usernames, &request.approved_preview_ids) {
            (Some(usernames), None) => usernames.clone(),
            (None, Some(preview_ids)) => {
                if preview_ids.is_empty() {
                    return Err(JobError::InvalidRequest("no approved preview ids provided".into()));
                }
                self.inner.approvals.resolve(preview_ids).await?
            }
            _ => {
                return Err(JobError::InvalidRequest(
                    "provide exactly one of target usernames or approved preview ids".into(),
                ));
            }
        };

        if usernames.is_empty() {
            return Err(JobError::InvalidRequest("no usernames provided".into()));
        }
        Ok(usernames)
    }

    /// Validates the request, persists the job as `processing` and spawns the
    /// import. The returned handle resolves once the job record is final.
    pub async fn start_job(
        &self,
        request: StartImportRequest,
    ) -> JobResult<(JobStarted, JoinHandle<()>)> {
        let usernames = self.resolve_usernames(&request).await?;
        let jobs = &self.inner.jobs;

        let job = jobs.create_job(request.job_name.trim(), usernames.clone()).await?;
        let validation = DataValidator.validate_usernames(&usernames);
        for warning in &validation.warnings {
            tracing::warn!(job_id = %job.id, warning = %warning, "username warning");
        }
        if !validation.is_valid {
            let message = format!("username validation failed: {}", validation.errors.join("; "));
            jobs.fail(job.id, ErrorLogEntry::new(ErrorKind::Validation, None, message))
                .await?;
            return Err(JobError::Validation(validation.errors));
        }

        // Duplicates were reported as warnings; each username is imported once.
        let usernames: Vec<String> = usernames
            .into_iter()
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();
        if let Err(e) = jobs.mark_processing(job.id, usernames.clone()).await {
            let entry = ErrorLogEntry::new(
                ErrorKind::Orchestration,
                None,
                format!("could not start processing: {e}"),
            );
            if let Err(fail_error) = jobs.fail(job.id, entry).await {
                tracing::error!(job_id = %job.id, error = %fail_error, "could not mark job failed");
            }
            return Err(e);
        }

        let plan = self
            .inner
            .settings
            .plan
            .clone()
            .unwrap_or_else(|| ProcessingPlan::for_items(usernames.len()));
        let estimate = estimate_duration(usernames.len(), &plan);
        let estimated_completion =
            Utc::now() + TimeDelta::from_std(estimate).unwrap_or(TimeDelta::zero());

        let cancel = CancellationToken::new();
        self.inner.running.lock().insert(job.id, cancel.clone());

        let inner = self.inner.clone();
        let job_id = job.id;
        let task_usernames = usernames.clone();
        let handle = tokio::spawn(async move {
            inner.run_job(job_id, task_usernames, plan, cancel).await;
        });

        tracing::info!(job_id = %job_id, users = usernames.len(), "import job started");
        Ok((
            JobStarted {
                job_id,
                message: format!("import of {} users started", usernames.len()),
                target_usernames: usernames,
                estimated_completion,
            },
            handle,
        ))
    }

    /// Stops a running job after its in-flight users finish.
    pub async fn cancel_job(&self, job_id: JobId) -> JobResult<()> {
        if let Some(token) = self.inner.running.lock().get(&job_id) {
            tracing::info!(job_id = %job_id, "cancelling import job");
            token.cancel();
            return Ok(());
        }

        let job = self.inner.jobs.get_job(job_id).await?;
        if job.status.is_terminal() {
            Err(JobError::AlreadyFinished(job_id))
        } else {
            Err(JobError::InvalidRequest(format!("job {job_id} is not running")))
        }
    }
}

impl Inner {
    async fn run_job(
        self: Arc<Self>,
        job_id: JobId,
        usernames: Vec<String>,
        plan: ProcessingPlan,
        cancel: CancellationToken,
    ) {
        if let Err(e) = self.process_job(job_id, usernames, plan, &cancel).await {
            let entry = ErrorLogEntry::new(ErrorKind::Orchestration, None, e.to_string());
            if let Err(fail_error) = self.jobs.fail(job_id, entry).await {
                tracing::error!(job_id = %job_id, error = %fail_error, "could not mark job failed");
            }
            counter!(JOBS_FINISHED, "status" => "failed").increment(1);
        }
        self.running.lock().remove(&job_id);
    }

    async fn process_job(
        &self,
        job_id: JobId,
        usernames: Vec<String>,
        plan: ProcessingPlan,
        cancel: &CancellationToken,
    ) -> JobResult<()> {
        let total = usernames.len();
        let limiter = match &self.settings.rate_limit {
            Some(config) => RateLimiter::new(config.clone()),
            None => RateLimiter::for_workload(total),
        };
        let monitor = Arc::new(ImportMonitor::new(total));

        let importer = Arc::new(UserImporter {
            job_id,
            provider: self.provider.clone(),
            provisioner: UserProvisioner::new(self.store.clone()),
            vehicles: VehicleStore::new(self.store.clone()),
            transactions: TransactionManager::new(self.store.clone()),
            jobs: self.jobs.clone(),
            monitor: monitor.clone(),
            limiter,
            retry: self.settings.retry.clone(),
        });

        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let consumer = {
            let jobs = self.jobs.clone();
            let monitor = monitor.clone();
            tokio::spawn(async move { jobs.run_progress_consumer(job_id, rx, monitor).await })
        };

        let results = self
            .processor
            .process(
                usernames.clone(),
                &plan,
                move |username: String| {
                    let importer = importer.clone();
                    async move { Ok::<_, Infallible>(importer.import_user(&username).await) }
                },
                Some(tx),
                cancel,
            )
            .await;

        if let Err(e) = consumer.await {
            tracing::error!(job_id = %job_id, error = %e, "progress consumer failed");
        }

        let mut panicked = Vec::new();
        let user_results: Vec<UserImportResult> = usernames
            .iter()
            .zip(results)
            .map(|(username, result)| match result {
                Ok(result) => result,
                Err(ItemError::Failed(never)) => match never {},
                Err(ItemError::Panicked) => {
                    monitor.update_user_progress(false, 0, Duration::ZERO);
                    panicked.push(ErrorLogEntry::new(
                        ErrorKind::User,
                        Some(username.as_str()),
                        "import worker panicked",
                    ));
                    UserImportResult::failed(username, "import worker panicked")
                }
                Err(ItemError::Cancelled) => UserImportResult::failed(username, "import cancelled"),
            })
            .collect();
        if !panicked.is_empty() {
            self.jobs.append_errors(job_id, panicked).await?;
        }

        if cancel.is_cancelled() {
            let done = user_results
                .iter()
                .filter(|r| r.error.as_deref() != Some("import cancelled"))
                .count();
            let entry = ErrorLogEntry::new(
                ErrorKind::Cancelled,
                None,
                format!("job cancelled after {done} of {total} users"),
            );
            self.jobs.fail(job_id, entry).await?;
            counter!(JOBS_FINISHED, "status" => "cancelled").increment(1);
            return Ok(());
        }

        self.jobs
            .set_step(job_id, "consistency_audit", None)
            .await?;
        let audit = ConsistencyAuditor::new(self.store.clone())
            .perform_consistency_audit()
            .await;

        let successful = user_results.iter().filter(|r| r.success).count();
        let vehicles = user_results.iter().map(|r| r.vehicle_count).sum();
        let import_results = serde_json::json!({
            "user_results": user_results,
            "metrics": monitor.snapshot(),
            "alerts": monitor.alerts(),
            "health_score": monitor.health_score(),
            "audit": audit,
        });

        let job = self
            .jobs
            .complete(
                job_id,
                JobSummary {
                    successful,
                    failed: total - successful,
                    vehicles,
                    import_results,
                },
            )
            .await?;
        counter!(JOBS_FINISHED, "status" => job.status.as_str()).increment(1);
        Ok(())
    }
}

#[derive(Debug)]
struct ImportedUser {
    user_id: UserId,
    vehicle_count: usize,
}

/// A failed attempt at one user, after its rollback ran.
#[derive(Debug)]
struct AttemptFailure {
    error: ImportError,
    rollback_performed: bool,
    rollback_error: Option<String>,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rollback_error {
            Some(rollback_error) => {
                write!(f, "{} (rollback failed: {rollback_error})", self.error)
            }
            None => write!(f, "{}", self.error),
        }
    }
}

/// Imports single users for one job.
struct UserImporter {
    job_id: JobId,
    provider: Arc<dyn VehicleProvider>,
    provisioner: UserProvisioner,
    vehicles: VehicleStore,
    transactions: TransactionManager,
    jobs: Arc<JobStatusManager>,
    monitor: Arc<ImportMonitor>,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl UserImporter {
    async fn import_user(&self, username: &str) -> UserImportResult {
        let started = Instant::now();
        let retried = self.retry.run(|_| self.attempt(username)).await;
        let duration = started.elapsed();

        self.monitor.record_retries(retried.retries);

        let result = match retried.result {
            Ok(imported) => UserImportResult {
                username: username.to_string(),
                success: true,
                user_id: Some(imported.user_id),
                vehicle_count: imported.vehicle_count,
                error: None,
                duration_ms: duration.as_millis() as u64,
                retry_count: retried.retries,
                rollback_performed: false,
            },
            Err(failure) => {
                let message = failure.to_string();
                tracing::warn!(job_id = %self.job_id, username, error = %message, "user import failed");
                let entry = ErrorLogEntry::new(ErrorKind::User, Some(username), message.clone());
                if let Err(e) = self.jobs.append_errors(self.job_id, vec![entry]).await {
                    tracing::warn!(job_id = %self.job_id, error = %e, "could not record user error");
                }
                UserImportResult {
                    username: username.to_string(),
                    success: false,
                    user_id: None,
                    vehicle_count: 0,
                    error: Some(message),
                    duration_ms: duration.as_millis() as u64,
                    retry_count: retried.retries,
                    rollback_performed: failure.rollback_performed,
                }
            }
        };

        self.monitor
            .update_user_progress(result.success, result.vehicle_count, duration);
        result
    }

    /// One transactional attempt. Anything it created is rolled back on failure.
    async fn attempt(&self, username: &str) -> Result<ImportedUser, AttemptFailure> {
        let outcome = self
            .transactions
            .execute_user_transaction(username, || async {
                let mut log = TransactionLog::new();
                let result = self.import_steps(username, &mut log).await;
                (log, result)
            })
            .await;

        if outcome.rollback_performed || outcome.rollback_error.is_some() {
            let status = if outcome.rollback_performed { "success" } else { "failure" };
            counter!(ROLLBACKS, "outcome" => status).increment(1);
        }

        outcome.result.map_err(|error| AttemptFailure {
            error,
            rollback_performed: outcome.rollback_performed,
            rollback_error: outcome.rollback_error.map(|e| e.to_string()),
        })
    }

    async fn import_steps(
        &self,
        username: &str,
        log: &mut TransactionLog,
    ) -> Result<ImportedUser, ImportError> {
        let identity = self.provisioner.provision_user(username).await?;
        log.identity_created(identity.id, username);

        let vehicles = self.provider.fetch_vehicles(username, &self.limiter).await?;
        log.note(format!("fetched {} vehicles", vehicles.len()));

        let warnings = DataValidator.validate_provider_response(username, &vehicles);
        for warning in &warnings {
            tracing::warn!(job_id = %self.job_id, username, warning = %warning, "provider data warning");
        }

        let vehicles = self
            .provider
            .enrich_with_positions(vehicles, &self.limiter)
            .await;

        let report = self
            .vehicles
            .store_vehicles(&vehicles, username, identity.id, self.job_id)
            .await;
        log.vehicles_written(&report);

        if report.failed > 0 {
            let first_error = report
                .errors
                .first()
                .map(|e| format!("{}: {}", e.device_id, e.message))
                .unwrap_or_default();
            return Err(ImportError::Storage {
                failed: report.failed,
                first_error,
            });
        }

        Ok(ImportedUser {
            user_id: identity.id,
            vehicle_count: report.successful,
        })
    }
}
