//! Unit-of-work semantics for importing one user.
//!
//! The store has no multi-call transactions, so each user import keeps an
//! append-only [`TransactionLog`] of what it created. When the import fails the
//! log is turned into a [`RollbackPlan`] by a pure function and the plan is
//! executed against the store. Records that existed before the import are
//! never deleted.

use crate::errors::ImportError;
use crate::store::{Datastore, StoreError};
use crate::types::UserId;
use crate::vehicles::StoreReport;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransactionEntry {
    IdentityCreated { user_id: UserId, username: String },
    VehicleCreated { device_id: String },
    VehicleUpdated { device_id: String },
    Note { message: String },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TransactionLog {
    entries: Vec<TransactionEntry>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity_created(&mut self, user_id: UserId, username: &str) {
        self.entries.push(TransactionEntry::IdentityCreated {
            user_id,
            username: username.to_string(),
        });
    }

    pub fn vehicles_written(&mut self, report: &StoreReport) {
        self.entries.extend(
            report
                .created_ids
                .iter()
                .map(|device_id| TransactionEntry::VehicleCreated {
                    device_id: device_id.clone(),
                }),
        );
        self.entries.extend(
            report
                .updated_ids
                .iter()
                .map(|device_id| TransactionEntry::VehicleUpdated {
                    device_id: device_id.clone(),
                }),
        );
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.entries.push(TransactionEntry::Note {
            message: message.into(),
        });
    }

    pub fn entries(&self) -> &[TransactionEntry] {
        &self.entries
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IdentityCandidate {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RollbackPlan {
    /// Created vehicles, most recent first.
    pub vehicles: Vec<String>,
    /// Removed only if no vehicles for the username remain afterwards.
    pub identity: Option<IdentityCandidate>,
}

impl RollbackPlan {
    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty() && self.identity.is_none()
    }
}

pub fn plan_rollback(log: &TransactionLog) -> RollbackPlan {
    let mut plan = RollbackPlan::default();
    for entry in log.entries().iter().rev() {
        match entry {
            TransactionEntry::VehicleCreated { device_id } => plan.vehicles.push(device_id.clone()),
            TransactionEntry::IdentityCreated { user_id, username } => {
                plan.identity = Some(IdentityCandidate {
                    user_id: *user_id,
                    username: username.clone(),
                });
            }
            TransactionEntry::VehicleUpdated { .. } | TransactionEntry::Note { .. } => {}
        }
    }
    plan
}

#[derive(Debug)]
pub struct TransactionOutcome<T> {
    pub result: Result<T, ImportError>,
    pub rollback_performed: bool,
    /// Set when the rollback itself failed. The original error stays in `result`.
    pub rollback_error: Option<StoreError>,
    pub log: TransactionLog,
}

pub struct TransactionManager {
    store: Arc<dyn Datastore>,
}

impl TransactionManager {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        TransactionManager { store }
    }

    /// Runs `op` and undoes what its log says it created if it fails.
    pub async fn execute_user_transaction<T, F, Fut>(
        &self,
        username: &str,
        op: F,
    ) -> TransactionOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = (TransactionLog, Result<T, ImportError>)>,
    {
        let (log, result) = op().await;

        let error = match &result {
            Ok(_) => {
                return TransactionOutcome {
                    result,
                    rollback_performed: false,
                    rollback_error: None,
                    log,
                };
            }
            Err(e) => e,
        };

        let plan = plan_rollback(&log);
        if plan.is_empty() {
            return TransactionOutcome {
                result,
                rollback_performed: false,
                rollback_error: None,
                log,
            };
        }

        tracing::info!(
            username,
            error = %error,
            vehicles = plan.vehicles.len(),
            identity = plan.identity.is_some(),
            "rolling back user import"
        );

        match self.rollback(username, &plan).await {
            Ok(()) => TransactionOutcome {
                result,
                rollback_performed: true,
                rollback_error: None,
                log,
            },
            Err(e) => {
                tracing::error!(username, error = %e, "rollback failed");
                TransactionOutcome {
                    result,
                    rollback_performed: false,
                    rollback_error: Some(e),
                    log,
                }
            }
        }
    }

    async fn rollback(&self, username: &str, plan: &RollbackPlan) -> Result<(), StoreError> {
        if !plan.vehicles.is_empty() {
            let removed = self.store.delete_vehicles(&plan.vehicles, username).await?;
            tracing::debug!(removed, planned = plan.vehicles.len(), "removed created vehicles");
        }

        if let Some(identity) = &plan.identity {
            let remaining = self
                .store
                .count_vehicles_for_username(&identity.username)
                .await?;
            if remaining == 0 {
                self.store.delete_identity(identity.user_id).await?;
            } else {
                tracing::warn!(
                    username = %identity.username,
                    remaining,
                    "keeping identity that still owns vehicles"
                );
            }
        }
        Ok(())
    }
}
