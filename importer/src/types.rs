//! Records shared across the import pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = Uuid;
pub type JobId = Uuid;

/// Import source tag stored on every identity and profile created by the importer.
pub const IMPORT_SOURCE: &str = "provider_import";

/// A last-known position as reported by the telematics provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    pub recorded_at: Option<String>,
}

impl Position {
    pub fn has_valid_coordinates(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A vehicle as normalized from a provider response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub device_id: String,
    pub name: String,
    pub sim_number: Option<String>,
    pub status: Option<String>,
    pub position: Option<Position>,
    /// The provider object this vehicle was decoded from.
    pub raw_payload: serde_json::Value,
}

/// A vehicle as persisted in the store. Keyed by `device_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub device_id: String,
    pub name: String,
    pub owner_id: UserId,
    pub username: String,
    pub sim_number: Option<String>,
    pub status: Option<String>,
    pub position: Option<Position>,
    pub raw_payload: serde_json::Value,
    /// Id of the job that last wrote this record.
    pub import_batch: JobId,
    pub updated_at: DateTime<Utc>,
}

impl VehicleRecord {
    pub fn from_vehicle(vehicle: &Vehicle, username: &str, owner_id: UserId, job_id: JobId) -> Self {
        VehicleRecord {
            device_id: vehicle.device_id.clone(),
            name: vehicle.name.clone(),
            owner_id,
            username: username.to_string(),
            sim_number: vehicle.sim_number.clone(),
            status: vehicle.status.clone(),
            position: vehicle.position.clone(),
            raw_payload: vehicle.raw_payload.clone(),
            import_batch: job_id,
            updated_at: Utc::now(),
        }
    }
}

/// A local account created for an external username.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub username: String,
    pub email: String,
    /// Digest of the one-time credential; the credential itself is never stored.
    pub credential_digest: String,
    pub temporary_credential: bool,
    pub import_source: Option<String>,
    pub needs_credential_reset: bool,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn is_imported(&self) -> bool {
        self.import_source.as_deref() == Some(IMPORT_SOURCE)
    }
}

/// Profile record linked one-to-one with an identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub username: String,
    pub import_source: String,
    pub needs_credential_reset: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Initialized,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Initialized => "initialized",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Status only moves forward. Validation failures go straight from
    /// `Initialized` to `Failed`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Initialized, JobStatus::Processing)
                | (JobStatus::Initialized, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    User,
    Orchestration,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub kind: ErrorKind,
    pub username: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorLogEntry {
    pub fn new(kind: ErrorKind, username: Option<&str>, message: impl Into<String>) -> Self {
        ErrorLogEntry {
            kind,
            username: username.map(String::from),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The persisted job record that callers poll for progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: JobId,
    pub job_name: String,
    pub status: JobStatus,
    pub target_usernames: Vec<String>,
    pub total_usernames: usize,
    pub processed_usernames: usize,
    pub successful_imports: usize,
    pub failed_imports: usize,
    pub total_vehicles_imported: usize,
    pub progress_percentage: f64,
    pub current_step: String,
    pub step_details: Option<String>,
    pub error_log: Vec<ErrorLogEntry>,
    pub import_results: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    pub fn new(job_name: &str, target_usernames: Vec<String>) -> Self {
        let now = Utc::now();
        ImportJob {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            status: JobStatus::Initialized,
            total_usernames: target_usernames.len(),
            target_usernames,
            processed_usernames: 0,
            successful_imports: 0,
            failed_imports: 0,
            total_vehicles_imported: 0,
            progress_percentage: 0.0,
            current_step: "initialized".into(),
            step_details: None,
            error_log: Vec::new(),
            import_results: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub(crate) fn recompute_progress(&mut self) {
        self.progress_percentage = if self.total_usernames == 0 {
            100.0
        } else {
            let ratio = self.processed_usernames as f64 / self.total_usernames as f64;
            (ratio * 10_000.0).round() / 100.0
        };
    }
}

/// Outcome of importing a single username.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserImportResult {
    pub username: String,
    pub success: bool,
    pub user_id: Option<UserId>,
    pub vehicle_count: usize,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub retry_count: u32,
    pub rollback_performed: bool,
}

impl UserImportResult {
    pub fn failed(username: &str, error: impl Into<String>) -> Self {
        UserImportResult {
            username: username.to_string(),
            success: false,
            user_id: None,
            vehicle_count: 0,
            error: Some(error.into()),
            duration_ms: 0,
            retry_count: 0,
            rollback_performed: false,
        }
    }
}
