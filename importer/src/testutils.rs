use crate::provider::{ProviderError, VehicleProvider};
use crate::rate_limiter::RateLimiter;
use crate::store::{Datastore, MemoryDatastore, StoreError, UpsertOutcome};
use crate::types::{
    IMPORT_SOURCE, Identity, ImportJob, JobId, Position, Profile, UserId, Vehicle, VehicleRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

pub fn identity(username: &str) -> Identity {
    Identity {
        id: Uuid::new_v4(),
        username: username.to_string(),
        email: format!("{username}@imported.fleet.invalid"),
        credential_digest: "digest".into(),
        temporary_credential: true,
        import_source: Some(IMPORT_SOURCE.into()),
        needs_credential_reset: true,
        created_at: Utc::now(),
    }
}

pub fn vehicle(device_id: &str) -> Vehicle {
    Vehicle {
        device_id: device_id.to_string(),
        name: format!("Vehicle {device_id}"),
        sim_number: None,
        status: Some("active".into()),
        position: None,
        raw_payload: serde_json::json!({ "device_id": device_id }),
    }
}

pub fn position(latitude: f64, longitude: f64) -> Position {
    Position {
        latitude,
        longitude,
        speed: Some(0.0),
        course: None,
        recorded_at: None,
    }
}

pub fn vehicle_record(device_id: &str, username: &str, owner_id: UserId) -> VehicleRecord {
    VehicleRecord::from_vehicle(&vehicle(device_id), username, owner_id, Uuid::new_v4())
}

/// Switches for [`FaultyStore`]. Everything is off by default.
#[derive(Default)]
pub struct Faults {
    pub fail_batch_upserts: bool,
    pub fail_all_upserts: bool,
    /// Single-record upserts of these device ids fail.
    pub reject_device_ids: HashSet<String>,
    pub fail_profile_insert: bool,
    pub fail_identity_delete: bool,
    pub fail_vehicle_deletes: bool,
    pub fail_list_vehicles: bool,
    /// The next this many job record updates fail.
    pub failing_job_updates: usize,
    /// Rows appended to every vehicle listing, e.g. to fake duplicates.
    pub extra_vehicles: Vec<VehicleRecord>,
}

/// A [`MemoryDatastore`] that fails on demand.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryDatastore,
    pub faults: Mutex<Faults>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn unavailable(what: &str) -> StoreError {
        StoreError::Unavailable(format!("injected {what} failure"))
    }
}

#[async_trait]
impl Datastore for FaultyStore {
    async fn find_identity_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Identity>, StoreError> {
        self.inner.find_identity_by_username(username).await
    }

    async fn get_identity(&self, id: UserId) -> Result<Option<Identity>, StoreError> {
        self.inner.get_identity(id).await
    }

    async fn insert_identity(&self, identity: Identity) -> Result<(), StoreError> {
        self.inner.insert_identity(identity).await
    }

    async fn delete_identity(&self, id: UserId) -> Result<(), StoreError> {
        if self.faults.lock().fail_identity_delete {
            return Err(Self::unavailable("identity delete"));
        }
        self.inner.delete_identity(id).await
    }

    async fn insert_profile(&self, profile: Profile) -> Result<(), StoreError> {
        if self.faults.lock().fail_profile_insert {
            return Err(Self::unavailable("profile insert"));
        }
        self.inner.insert_profile(profile).await
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        self.inner.list_identities().await
    }

    async fn upsert_vehicles(
        &self,
        records: Vec<VehicleRecord>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        {
            let faults = self.faults.lock();
            if faults.fail_batch_upserts || faults.fail_all_upserts {
                return Err(Self::unavailable("batch upsert"));
            }
        }
        self.inner.upsert_vehicles(records).await
    }

    async fn upsert_vehicle(&self, record: VehicleRecord) -> Result<UpsertOutcome, StoreError> {
        {
            let faults = self.faults.lock();
            if faults.fail_all_upserts || faults.reject_device_ids.contains(&record.device_id) {
                return Err(Self::unavailable("upsert"));
            }
        }
        self.inner.upsert_vehicle(record).await
    }

    async fn delete_vehicles(
        &self,
        device_ids: &[String],
        username: &str,
    ) -> Result<usize, StoreError> {
        if self.faults.lock().fail_vehicle_deletes {
            return Err(Self::unavailable("vehicle delete"));
        }
        self.inner.delete_vehicles(device_ids, username).await
    }

    async fn count_vehicles_for_username(&self, username: &str) -> Result<usize, StoreError> {
        self.inner.count_vehicles_for_username(username).await
    }

    async fn list_vehicles(&self) -> Result<Vec<VehicleRecord>, StoreError> {
        let extra = {
            let faults = self.faults.lock();
            if faults.fail_list_vehicles {
                return Err(Self::unavailable("vehicle listing"));
            }
            faults.extra_vehicles.clone()
        };
        let mut vehicles = self.inner.list_vehicles().await?;
        vehicles.extend(extra);
        Ok(vehicles)
    }

    async fn insert_job(&self, job: ImportJob) -> Result<(), StoreError> {
        self.inner.insert_job(job).await
    }

    async fn update_job(&self, job: ImportJob) -> Result<(), StoreError> {
        {
            let mut faults = self.faults.lock();
            if faults.failing_job_updates > 0 {
                faults.failing_job_updates -= 1;
                return Err(Self::unavailable("job update"));
            }
        }
        self.inner.update_job(job).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<ImportJob>, StoreError> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<ImportJob>, StoreError> {
        self.inner.list_jobs().await
    }
}

enum Scripted {
    Vehicles(Vec<Vehicle>),
    ProviderError { code: i64, message: String },
}

/// In-process provider answering from scripted responses. Unknown usernames
/// own no vehicles.
#[derive(Default)]
pub struct FakeProvider {
    responses: HashMap<String, Scripted>,
    positions: HashMap<String, Position>,
    transient_failures: Mutex<HashMap<String, u32>>,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vehicles(mut self, username: &str, vehicles: Vec<Vehicle>) -> Self {
        self.responses
            .insert(username.to_string(), Scripted::Vehicles(vehicles));
        self
    }

    pub fn with_error(mut self, username: &str, code: i64, message: &str) -> Self {
        self.responses.insert(
            username.to_string(),
            Scripted::ProviderError {
                code,
                message: message.to_string(),
            },
        );
        self
    }

    pub fn with_position(mut self, device_id: &str, position: Position) -> Self {
        self.positions.insert(device_id.to_string(), position);
        self
    }

    /// The first `failures` fetches for `username` fail with HTTP 503.
    pub fn with_transient_failures(self, username: &str, failures: u32) -> Self {
        self.transient_failures
            .lock()
            .insert(username.to_string(), failures);
        self
    }

    /// Number of vehicle-list fetches made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VehicleProvider for FakeProvider {
    async fn fetch_vehicles(
        &self,
        username: &str,
        limiter: &RateLimiter,
    ) -> Result<Vec<Vehicle>, ProviderError> {
        limiter.acquire(1).await?;
        self.calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut transient = self.transient_failures.lock();
            if let Some(remaining) = transient.get_mut(username).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(ProviderError::Status {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                });
            }
        }

        match self.responses.get(username) {
            Some(Scripted::Vehicles(vehicles)) => Ok(vehicles.clone()),
            Some(Scripted::ProviderError { code, message }) => Err(ProviderError::Provider {
                code: *code,
                message: message.clone(),
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn enrich_with_positions(
        &self,
        vehicles: Vec<Vehicle>,
        _limiter: &RateLimiter,
    ) -> Vec<Vehicle> {
        crate::provider::extract::merge_positions(vehicles, self.positions.clone())
    }
}
