//! Post-import consistency checks over the whole store.
//!
//! Every check runs on its own. A check that cannot complete is reported as a
//! failed check with an `audit_check_error` issue and the remaining checks
//! still run.

use crate::store::{Datastore, StoreError};
use crate::types::VehicleRecord;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

const MAX_SAMPLES: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuditIssue {
    pub issue_type: &'static str,
    pub severity: Severity,
    pub affected_records: usize,
    pub samples: Vec<String>,
}

impl AuditIssue {
    fn new(issue_type: &'static str, severity: Severity, findings: Vec<String>) -> Self {
        AuditIssue {
            issue_type,
            severity,
            affected_records: findings.len(),
            samples: findings.into_iter().take(MAX_SAMPLES).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuditReport {
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub issues: Vec<AuditIssue>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AuditReport {
    pub fn issues_of(&self, issue_type: &str) -> impl Iterator<Item = &AuditIssue> {
        self.issues
            .iter()
            .filter(move |issue| issue.issue_type == issue_type)
    }
}

pub struct ConsistencyAuditor {
    store: Arc<dyn Datastore>,
}

impl ConsistencyAuditor {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        ConsistencyAuditor { store }
    }

    pub async fn perform_consistency_audit(&self) -> AuditReport {
        let started_at = Utc::now();
        let results = [
            ("orphaned_vehicles", self.orphaned_vehicles().await),
            (
                "imported_users_without_vehicles",
                self.imported_users_without_vehicles().await,
            ),
            ("duplicate_device_ids", self.duplicate_device_ids().await),
            ("invalid_position_data", self.invalid_position_data().await),
            ("missing_required_fields", self.missing_required_fields().await),
        ];

        let mut report = AuditReport {
            checks_passed: 0,
            checks_failed: 0,
            issues: Vec::new(),
            started_at,
            finished_at: started_at,
        };

        for (check, result) in results {
            match result {
                Ok(None) => report.checks_passed += 1,
                Ok(Some(issue)) => {
                    tracing::warn!(
                        check,
                        severity = ?issue.severity,
                        affected = issue.affected_records,
                        "consistency issue found"
                    );
                    report.checks_failed += 1;
                    report.issues.push(issue);
                }
                Err(e) => {
                    tracing::error!(check, error = %e, "consistency check could not run");
                    report.checks_failed += 1;
                    report.issues.push(AuditIssue::new(
                        "audit_check_error",
                        Severity::Medium,
                        vec![format!("{check}: {e}")],
                    ));
                }
            }
        }

        report.finished_at = Utc::now();
        report
    }

    async fn orphaned_vehicles(&self) -> Result<Option<AuditIssue>, StoreError> {
        let owners: HashSet<_> = self
            .store
            .list_identities()
            .await?
            .into_iter()
            .map(|identity| identity.id)
            .collect();

        let findings: Vec<String> = self
            .store
            .list_vehicles()
            .await?
            .into_iter()
            .filter(|vehicle| !owners.contains(&vehicle.owner_id))
            .map(|vehicle| format!("{} owned by missing user {}", vehicle.device_id, vehicle.owner_id))
            .collect();

        Ok(issue_if_any("orphaned_vehicles", Severity::High, findings))
    }

    async fn imported_users_without_vehicles(&self) -> Result<Option<AuditIssue>, StoreError> {
        let mut findings = Vec::new();
        for identity in self.store.list_identities().await? {
            if !identity.is_imported() {
                continue;
            }
            if self
                .store
                .count_vehicles_for_username(&identity.username)
                .await?
                == 0
            {
                findings.push(identity.username);
            }
        }
        Ok(issue_if_any(
            "imported_users_without_vehicles",
            Severity::Medium,
            findings,
        ))
    }

    async fn duplicate_device_ids(&self) -> Result<Option<AuditIssue>, StoreError> {
        let mut counts: IndexMap<String, usize> = IndexMap::new();
        for vehicle in self.store.list_vehicles().await? {
            *counts.entry(vehicle.device_id).or_default() += 1;
        }
        let findings = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(device_id, count)| format!("{device_id} ({count} records)"))
            .collect();
        Ok(issue_if_any("duplicate_device_ids", Severity::High, findings))
    }

    async fn invalid_position_data(&self) -> Result<Option<AuditIssue>, StoreError> {
        let findings = self
            .store
            .list_vehicles()
            .await?
            .into_iter()
            .filter_map(|vehicle| {
                let position = vehicle.position.as_ref()?;
                (!position.has_valid_coordinates()).then(|| {
                    format!(
                        "{} at ({}, {})",
                        vehicle.device_id, position.latitude, position.longitude
                    )
                })
            })
            .collect();
        Ok(issue_if_any("invalid_position_data", Severity::Low, findings))
    }

    async fn missing_required_fields(&self) -> Result<Option<AuditIssue>, StoreError> {
        let findings = self
            .store
            .list_vehicles()
            .await?
            .iter()
            .filter_map(|vehicle| {
                let missing = missing_fields(vehicle);
                (!missing.is_empty())
                    .then(|| format!("{:?} missing {}", vehicle.device_id, missing.join(", ")))
            })
            .collect();
        Ok(issue_if_any("missing_required_fields", Severity::Medium, findings))
    }
}

fn missing_fields(vehicle: &VehicleRecord) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if vehicle.device_id.trim().is_empty() {
        missing.push("device_id");
    }
    if vehicle.name.trim().is_empty() {
        missing.push("name");
    }
    if vehicle.owner_id.is_nil() {
        missing.push("owner_id");
    }
    if vehicle.username.trim().is_empty() {
        missing.push("username");
    }
    missing
}

fn issue_if_any(
    issue_type: &'static str,
    severity: Severity,
    findings: Vec<String>,
) -> Option<AuditIssue> {
    (!findings.is_empty()).then(|| AuditIssue::new(issue_type, severity, findings))
}
