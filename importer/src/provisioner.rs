//! Creates passwordless local accounts for external usernames.

use crate::store::{Datastore, StoreError};
use crate::types::{IMPORT_SOURCE, Identity, Profile};
use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::sync::Arc;
use uuid::Uuid;

const CREDENTIAL_LENGTH: usize = 32;
const PLACEHOLDER_EMAIL_DOMAIN: &str = "imported.fleet.invalid";

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("user {0} already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("profile creation failed: {source}")]
    ProfileFailed {
        source: StoreError,
        /// Set when the identity could not be removed after the profile failure.
        cleanup_error: Option<StoreError>,
    },
}

/// Maps a username onto something usable as an email local part.
fn sanitize_local_part(username: &str) -> String {
    let sanitized: String = username
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "user".to_string()
    } else {
        sanitized
    }
}

pub fn placeholder_email(username: &str) -> String {
    format!(
        "{}@{PLACEHOLDER_EMAIL_DOMAIN}",
        sanitize_local_part(username)
    )
}

/// Random one-time credential. It is hashed immediately and never stored.
fn generate_credential() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(CREDENTIAL_LENGTH)
        .map(char::from)
        .collect()
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

pub struct UserProvisioner {
    store: Arc<dyn Datastore>,
}

impl UserProvisioner {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        UserProvisioner { store }
    }

    pub async fn provision_user(&self, username: &str) -> Result<Identity, ProvisionError> {
        if self.store.find_identity_by_username(username).await?.is_some() {
            return Err(ProvisionError::AlreadyExists(username.to_string()));
        }

        let now = Utc::now();
        let identity = Identity {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: placeholder_email(username),
            credential_digest: sha256_hex(&generate_credential()),
            temporary_credential: true,
            import_source: Some(IMPORT_SOURCE.to_string()),
            needs_credential_reset: true,
            created_at: now,
        };
        self.store.insert_identity(identity.clone()).await?;

        let profile = Profile {
            user_id: identity.id,
            username: username.to_string(),
            import_source: IMPORT_SOURCE.to_string(),
            needs_credential_reset: true,
            created_at: now,
        };
        if let Err(source) = self.store.insert_profile(profile).await {
            let cleanup_error = self.store.delete_identity(identity.id).await.err();
            if let Some(e) = &cleanup_error {
                tracing::error!(username, user_id = %identity.id, error = %e, "failed to remove identity after profile failure");
            }
            return Err(ProvisionError::ProfileFailed {
                source,
                cleanup_error,
            });
        }

        tracing::info!(username, user_id = %identity.id, "provisioned imported user");
        Ok(identity)
    }
}
