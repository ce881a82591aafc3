//! Persistence for identities, vehicles and job records.
//!
//! The store is deliberately non-transactional: every call is applied on its
//! own and there is no multi-call rollback. Unit-of-work semantics are layered
//! on top by the transaction module.

use crate::types::{Identity, ImportJob, JobId, Profile, UserId, VehicleRecord};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("invalid record {device_id:?}: {reason}")]
    InvalidRecord { device_id: String, reason: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of upserting one vehicle record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub device_id: String,
    /// True when no record with this device id existed before the write.
    pub created: bool,
}

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn find_identity_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Identity>, StoreError>;
    async fn get_identity(&self, id: UserId) -> Result<Option<Identity>, StoreError>;
    async fn insert_identity(&self, identity: Identity) -> Result<(), StoreError>;
    /// Deletes the identity together with its profile.
    async fn delete_identity(&self, id: UserId) -> Result<(), StoreError>;
    async fn insert_profile(&self, profile: Profile) -> Result<(), StoreError>;
    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError>;

    /// Writes all records or none. A single invalid record fails the whole call.
    async fn upsert_vehicles(
        &self,
        records: Vec<VehicleRecord>,
    ) -> Result<Vec<UpsertOutcome>, StoreError>;
    async fn upsert_vehicle(&self, record: VehicleRecord) -> Result<UpsertOutcome, StoreError>;
    /// Removes the listed records that are still owned by `username`. Records
    /// another user has since overwritten are left alone. Returns the number
    /// of records actually removed.
    async fn delete_vehicles(
        &self,
        device_ids: &[String],
        username: &str,
    ) -> Result<usize, StoreError>;
    async fn count_vehicles_for_username(&self, username: &str) -> Result<usize, StoreError>;
    async fn list_vehicles(&self) -> Result<Vec<VehicleRecord>, StoreError>;

    async fn insert_job(&self, job: ImportJob) -> Result<(), StoreError>;
    async fn update_job(&self, job: ImportJob) -> Result<(), StoreError>;
    async fn get_job(&self, id: JobId) -> Result<Option<ImportJob>, StoreError>;
    /// Most recently created first.
    async fn list_jobs(&self) -> Result<Vec<ImportJob>, StoreError>;
}

#[derive(Default)]
struct MemoryData {
    identities: HashMap<UserId, Identity>,
    profiles: HashMap<UserId, Profile>,
    // Insertion ordered so listings are stable.
    vehicles: IndexMap<String, VehicleRecord>,
    jobs: HashMap<JobId, ImportJob>,
}

/// In-process store. Device ids are unique by construction; concurrent writes
/// to the same id resolve last-write-wins.
#[derive(Default)]
pub struct MemoryDatastore {
    data: RwLock<MemoryData>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_record(record: &VehicleRecord) -> Result<(), StoreError> {
        if record.device_id.trim().is_empty() {
            return Err(StoreError::InvalidRecord {
                device_id: record.device_id.clone(),
                reason: "device id is empty".into(),
            });
        }
        if record.username.is_empty() {
            return Err(StoreError::InvalidRecord {
                device_id: record.device_id.clone(),
                reason: "owner username is empty".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn find_identity_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Identity>, StoreError> {
        let data = self.data.read();
        Ok(data
            .identities
            .values()
            .find(|identity| identity.username == username)
            .cloned())
    }

    async fn get_identity(&self, id: UserId) -> Result<Option<Identity>, StoreError> {
        Ok(self.data.read().identities.get(&id).cloned())
    }

    async fn insert_identity(&self, identity: Identity) -> Result<(), StoreError> {
        let mut data = self.data.write();
        if data
            .identities
            .values()
            .any(|existing| existing.username == identity.username)
        {
            return Err(StoreError::Conflict(format!(
                "identity for {} already exists",
                identity.username
            )));
        }
        data.identities.insert(identity.id, identity);
        Ok(())
    }

    async fn delete_identity(&self, id: UserId) -> Result<(), StoreError> {
        let mut data = self.data.write();
        data.profiles.remove(&id);
        data.identities
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("identity {id}")))
    }

    async fn insert_profile(&self, profile: Profile) -> Result<(), StoreError> {
        let mut data = self.data.write();
        if !data.identities.contains_key(&profile.user_id) {
            return Err(StoreError::NotFound(format!("identity {}", profile.user_id)));
        }
        data.profiles.insert(profile.user_id, profile);
        Ok(())
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.data.read().identities.values().cloned().collect())
    }

    async fn upsert_vehicles(
        &self,
        records: Vec<VehicleRecord>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        for record in &records {
            Self::check_record(record)?;
        }

        let mut data = self.data.write();
        let outcomes = records
            .into_iter()
            .map(|record| {
                let device_id = record.device_id.clone();
                let created = data.vehicles.insert(device_id.clone(), record).is_none();
                UpsertOutcome { device_id, created }
            })
            .collect();
        Ok(outcomes)
    }

    async fn upsert_vehicle(&self, record: VehicleRecord) -> Result<UpsertOutcome, StoreError> {
        Self::check_record(&record)?;
        let device_id = record.device_id.clone();
        let created = self
            .data
            .write()
            .vehicles
            .insert(device_id.clone(), record)
            .is_none();
        Ok(UpsertOutcome { device_id, created })
    }

    async fn delete_vehicles(
        &self,
        device_ids: &[String],
        username: &str,
    ) -> Result<usize, StoreError> {
        let mut data = self.data.write();
        let mut removed = 0;
        for id in device_ids {
            let owned = data
                .vehicles
                .get(id.as_str())
                .is_some_and(|record| record.username == username);
            if owned {
                data.vehicles.shift_remove(id.as_str());
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn count_vehicles_for_username(&self, username: &str) -> Result<usize, StoreError> {
        Ok(self
            .data
            .read()
            .vehicles
            .values()
            .filter(|v| v.username == username)
            .count())
    }

    async fn list_vehicles(&self) -> Result<Vec<VehicleRecord>, StoreError> {
        Ok(self.data.read().vehicles.values().cloned().collect())
    }

    async fn insert_job(&self, job: ImportJob) -> Result<(), StoreError> {
        let mut data = self.data.write();
        if data.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        data.jobs.insert(job.id, job);
        Ok(())
    }

    async fn update_job(&self, job: ImportJob) -> Result<(), StoreError> {
        let mut data = self.data.write();
        match data.jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("job {}", job.id))),
        }
    }

    async fn get_job(&self, id: JobId) -> Result<Option<ImportJob>, StoreError> {
        Ok(self.data.read().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<ImportJob>, StoreError> {
        let mut jobs: Vec<ImportJob> = self.data.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{identity, vehicle_record};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_upsert_overwrites_by_device_id() {
        let store = MemoryDatastore::new();
        let owner = Uuid::new_v4();

        let first = store
            .upsert_vehicle(vehicle_record("dev-1", "alice", owner))
            .await
            .unwrap();
        assert!(first.created);

        let mut renamed = vehicle_record("dev-1", "alice", owner);
        renamed.name = "Renamed".into();
        let second = store.upsert_vehicle(renamed).await.unwrap();
        assert!(!second.created);

        let vehicles = store.list_vehicles().await.unwrap();
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].name, "Renamed");
    }

    #[tokio::test]
    async fn test_batch_upsert_is_all_or_nothing() {
        let store = MemoryDatastore::new();
        let owner = Uuid::new_v4();

        let result = store
            .upsert_vehicles(vec![
                vehicle_record("dev-1", "alice", owner),
                vehicle_record("", "alice", owner),
            ])
            .await;
        assert!(matches!(result, Err(StoreError::InvalidRecord { .. })));
        assert!(store.list_vehicles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_identity_username_is_unique() {
        let store = MemoryDatastore::new();
        store.insert_identity(identity("alice")).await.unwrap();
        let result = store.insert_identity(identity("alice")).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_delete_identity_removes_profile() {
        let store = MemoryDatastore::new();
        let alice = identity("alice");
        let id = alice.id;
        store.insert_identity(alice).await.unwrap();
        store
            .insert_profile(Profile {
                user_id: id,
                username: "alice".into(),
                import_source: "provider_import".into(),
                needs_credential_reset: true,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        store.delete_identity(id).await.unwrap();
        assert!(store.get_identity(id).await.unwrap().is_none());
        assert!(matches!(
            store.delete_identity(id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_vehicles_counts_removed() {
        let store = MemoryDatastore::new();
        let owner = Uuid::new_v4();
        store
            .upsert_vehicles(vec![
                vehicle_record("dev-1", "alice", owner),
                vehicle_record("dev-2", "alice", owner),
            ])
            .await
            .unwrap();

        let removed = store
            .delete_vehicles(&["dev-1".into(), "missing".into()], "alice")
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count_vehicles_for_username("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_vehicles_skips_records_owned_by_others() {
        let store = MemoryDatastore::new();
        store
            .upsert_vehicle(vehicle_record("dev-1", "bob", Uuid::new_v4()))
            .await
            .unwrap();

        let removed = store.delete_vehicles(&["dev-1".into()], "alice").await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.count_vehicles_for_username("bob").await.unwrap(), 1);
    }
}
