//! Persists normalized vehicles for one user.
//!
//! Writes go out as a single batch upsert first. If the store rejects the batch
//! the records are retried one at a time so that a single bad record only
//! costs itself.

use crate::store::{Datastore, UpsertOutcome};
use crate::types::{JobId, UserId, Vehicle, VehicleRecord};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordError {
    pub device_id: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StoreReport {
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<RecordError>,
    /// Device ids that did not exist before this write, in write order.
    pub created_ids: Vec<String>,
    pub updated_ids: Vec<String>,
}

impl StoreReport {
    fn record(&mut self, outcome: UpsertOutcome) {
        self.successful += 1;
        if outcome.created {
            self.created_ids.push(outcome.device_id);
        } else {
            self.updated_ids.push(outcome.device_id);
        }
    }
}

pub struct VehicleStore {
    store: Arc<dyn Datastore>,
}

impl VehicleStore {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        VehicleStore { store }
    }

    pub async fn store_vehicles(
        &self,
        vehicles: &[Vehicle],
        username: &str,
        user_id: UserId,
        job_id: JobId,
    ) -> StoreReport {
        let mut report = StoreReport::default();
        if vehicles.is_empty() {
            return report;
        }

        let records: Vec<VehicleRecord> = vehicles
            .iter()
            .map(|vehicle| VehicleRecord::from_vehicle(vehicle, username, user_id, job_id))
            .collect();

        match self.store.upsert_vehicles(records.clone()).await {
            Ok(outcomes) => {
                for outcome in outcomes {
                    report.record(outcome);
                }
                return report;
            }
            Err(e) => {
                tracing::warn!(
                    username,
                    count = records.len(),
                    error = %e,
                    "batch vehicle upsert failed, falling back to single writes"
                );
            }
        }

        for record in records {
            let device_id = record.device_id.clone();
            match self.store.upsert_vehicle(record).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    tracing::warn!(username, device_id = %device_id, error = %e, "vehicle upsert failed");
                    report.failed += 1;
                    report.errors.push(RecordError {
                        device_id,
                        message: e.to_string(),
                    });
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDatastore;
    use crate::testutils::{FaultyStore, vehicle};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_batch_path_reports_created_and_updated() {
        let store = Arc::new(MemoryDatastore::new());
        let vehicles = VehicleStore::new(store.clone());
        let owner = Uuid::new_v4();

        let first = vehicles
            .store_vehicles(&[vehicle("A"), vehicle("B")], "alice", owner, Uuid::new_v4())
            .await;
        assert_eq!(first.successful, 2);
        assert_eq!(first.created_ids, ["A", "B"]);
        assert!(first.updated_ids.is_empty());

        let second = vehicles
            .store_vehicles(&[vehicle("B"), vehicle("C")], "alice", owner, Uuid::new_v4())
            .await;
        assert_eq!(second.created_ids, ["C"]);
        assert_eq!(second.updated_ids, ["B"]);
        assert_eq!(store.list_vehicles().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_reimport_is_idempotent_and_last_run_wins() {
        let store = Arc::new(MemoryDatastore::new());
        let vehicles = VehicleStore::new(store.clone());
        let owner = Uuid::new_v4();
        let first_job = Uuid::new_v4();
        let second_job = Uuid::new_v4();

        vehicles
            .store_vehicles(&[vehicle("A"), vehicle("B")], "alice", owner, first_job)
            .await;

        let mut renamed = vehicle("A");
        renamed.name = "Renamed".into();
        vehicles
            .store_vehicles(&[renamed, vehicle("B")], "alice", owner, second_job)
            .await;

        let stored = store.list_vehicles().await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].name, "Renamed");
        assert!(stored.iter().all(|v| v.import_batch == second_job));
    }

    #[tokio::test]
    async fn test_falls_back_to_single_writes() {
        let store = Arc::new(FaultyStore::new());
        {
            let mut faults = store.faults.lock();
            faults.fail_batch_upserts = true;
            faults.reject_device_ids.insert("B".into());
        }
        let vehicles = VehicleStore::new(store.clone());

        let report = vehicles
            .store_vehicles(
                &[vehicle("A"), vehicle("B"), vehicle("C")],
                "alice",
                Uuid::new_v4(),
                Uuid::new_v4(),
            )
            .await;

        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].device_id, "B");
        assert_eq!(report.created_ids, ["A", "C"]);
        assert_eq!(store.inner.list_vehicles().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_input_touches_nothing() {
        let store = Arc::new(FaultyStore::new());
        store.faults.lock().fail_all_upserts = true;
        let report = VehicleStore::new(store)
            .store_vehicles(&[], "alice", Uuid::new_v4(), Uuid::new_v4())
            .await;
        assert_eq!(report, StoreReport::default());
    }
}
