use crate::provider::ProviderError;
use crate::provisioner::ProvisionError;
use crate::store::StoreError;
use crate::types::{JobId, JobStatus};
use thiserror::Error;

/// Why importing a single username failed.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{failed} vehicle(s) could not be stored, first error: {first_error}")]
    Storage { failed: usize, first_error: String },
}

pub type JobResult<T> = std::result::Result<T, JobError>;

/// Errors surfaced by job management and the job API.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job {0} has already finished")]
    AlreadyFinished(JobId),

    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
