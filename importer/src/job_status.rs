//! Persistence of job records and their status machine.
//!
//! Every mutation is a read-modify-write of the stored record, serialized by
//! one async lock so that the progress consumer and the orchestrator never
//! overwrite each other's changes.

use crate::errors::{JobError, JobResult};
use crate::monitoring::ImportMonitor;
use crate::parallel::BatchProgress;
use crate::store::Datastore;
use crate::types::{ErrorLogEntry, ImportJob, JobId, JobStatus};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Cumulative counters reported while a job runs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobProgress {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub vehicles: usize,
    pub step_details: Option<String>,
}

/// Final counters and results written when a job completes.
#[derive(Clone, Debug, PartialEq)]
pub struct JobSummary {
    pub successful: usize,
    pub failed: usize,
    pub vehicles: usize,
    pub import_results: serde_json::Value,
}

pub struct JobStatusManager {
    store: Arc<dyn Datastore>,
    write_lock: Mutex<()>,
}

impl JobStatusManager {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        JobStatusManager {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn create_job(
        &self,
        job_name: &str,
        target_usernames: Vec<String>,
    ) -> JobResult<ImportJob> {
        let job = ImportJob::new(job_name, target_usernames);
        self.store.insert_job(job.clone()).await?;
        tracing::info!(job_id = %job.id, job_name, total = job.total_usernames, "created import job");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> JobResult<ImportJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    async fn update<F>(&self, job_id: JobId, mutate: F) -> JobResult<ImportJob>
    where
        F: FnOnce(&mut ImportJob) -> JobResult<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut job = self.get_job(job_id).await?;
        mutate(&mut job)?;
        job.updated_at = Utc::now();
        self.store.update_job(job.clone()).await?;
        Ok(job)
    }

    fn transition(job: &mut ImportJob, next: JobStatus) -> JobResult<()> {
        if !job.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: job.status,
                to: next,
            });
        }
        tracing::debug!(job_id = %job.id, from = %job.status, to = %next, "job status change");
        job.status = next;
        if next.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub async fn mark_processing(
        &self,
        job_id: JobId,
        usernames: Vec<String>,
    ) -> JobResult<ImportJob> {
        self.update(job_id, |job| {
            Self::transition(job, JobStatus::Processing)?;
            job.total_usernames = usernames.len();
            job.target_usernames = usernames;
            job.current_step = "processing_users".into();
            job.step_details = Some(format!("importing {} users", job.total_usernames));
            job.recompute_progress();
            Ok(())
        })
        .await
    }

    /// Counters only move up and `processed` never exceeds the total. Updates
    /// for finished jobs are ignored.
    pub async fn apply_progress(
        &self,
        job_id: JobId,
        progress: JobProgress,
    ) -> JobResult<ImportJob> {
        self.update(job_id, |job| {
            if job.status.is_terminal() {
                return Ok(());
            }
            let processed = progress.processed.min(job.total_usernames);
            job.processed_usernames = job.processed_usernames.max(processed);
            job.successful_imports = job.successful_imports.max(progress.successful);
            job.failed_imports = job.failed_imports.max(progress.failed);
            job.total_vehicles_imported = job.total_vehicles_imported.max(progress.vehicles);
            if progress.step_details.is_some() {
                job.step_details = progress.step_details;
            }
            job.recompute_progress();
            Ok(())
        })
        .await
    }

    pub async fn set_step(
        &self,
        job_id: JobId,
        step: &str,
        details: Option<String>,
    ) -> JobResult<ImportJob> {
        self.update(job_id, |job| {
            job.current_step = step.to_string();
            job.step_details = details;
            Ok(())
        })
        .await
    }

    pub async fn append_errors(
        &self,
        job_id: JobId,
        entries: Vec<ErrorLogEntry>,
    ) -> JobResult<ImportJob> {
        self.update(job_id, |job| {
            job.error_log.extend(entries);
            Ok(())
        })
        .await
    }

    /// Finishes a processed job. The final status is `failed` only when no
    /// username succeeded.
    pub async fn complete(&self, job_id: JobId, summary: JobSummary) -> JobResult<ImportJob> {
        let job = self
            .update(job_id, |job| {
                let status = if summary.successful == 0 && summary.failed > 0 {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                };
                Self::transition(job, status)?;
                job.processed_usernames = job.total_usernames;
                job.successful_imports = summary.successful;
                job.failed_imports = summary.failed;
                job.total_vehicles_imported = summary.vehicles;
                job.import_results = Some(summary.import_results);
                job.current_step = status.as_str().into();
                job.step_details = Some(format!(
                    "{} succeeded, {} failed, {} vehicles",
                    summary.successful, summary.failed, summary.vehicles
                ));
                job.recompute_progress();
                Ok(())
            })
            .await?;

        tracing::info!(
            job_id = %job.id,
            status = %job.status,
            successful = job.successful_imports,
            failed = job.failed_imports,
            vehicles = job.total_vehicles_imported,
            "import job finished"
        );
        Ok(job)
    }

    pub async fn fail(&self, job_id: JobId, entry: ErrorLogEntry) -> JobResult<ImportJob> {
        tracing::error!(job_id = %job_id, error = %entry.message, "import job failed");
        self.update(job_id, |job| {
            Self::transition(job, JobStatus::Failed)?;
            job.current_step = JobStatus::Failed.as_str().into();
            job.step_details = Some(entry.message.clone());
            job.error_log.push(entry);
            Ok(())
        })
        .await
    }

    /// Drains batch progress for one job and writes it to the job record.
    /// Returns once every sender is dropped.
    ///
    /// Outcome counters come from the monitor, which also sees users finished
    /// in batches that are still running. `processed` covers those users too,
    /// so `successful + failed` never exceeds it.
    pub async fn run_progress_consumer(
        &self,
        job_id: JobId,
        mut rx: mpsc::Receiver<BatchProgress>,
        monitor: Arc<ImportMonitor>,
    ) {
        while let Some(update) = rx.recv().await {
            let snapshot = monitor.snapshot();
            let settled = snapshot.successful_users + snapshot.failed_users;
            let progress = JobProgress {
                processed: update.processed_items.max(settled),
                successful: snapshot.successful_users,
                failed: snapshot.failed_users,
                vehicles: snapshot.total_vehicles,
                step_details: Some(format!(
                    "batch {} of {} complete",
                    update.completed_batches, update.total_batches
                )),
            };
            if let Err(e) = self.apply_progress(job_id, progress).await {
                tracing::warn!(job_id = %job_id, error = %e, "could not record job progress");
            }
        }
    }
}
