//! Input and provider data checks.
//!
//! Only username errors stop a job. Everything found in provider data is a
//! warning: the import proceeds with what it has.

use crate::types::Vehicle;
use serde::Serialize;
use std::collections::HashSet;

pub const MAX_USERNAME_LENGTH: usize = 64;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UsernameValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

fn is_allowed_username_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-')
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DataValidator;

impl DataValidator {
    pub fn validate_usernames(&self, usernames: &[String]) -> UsernameValidation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if usernames.is_empty() {
            errors.push("no usernames provided".to_string());
        }

        let mut seen = HashSet::new();
        for (index, username) in usernames.iter().enumerate() {
            if username.trim().is_empty() {
                errors.push(format!("username at position {index} is empty"));
                continue;
            }
            if username.chars().count() > MAX_USERNAME_LENGTH {
                warnings.push(format!(
                    "username {username:?} is longer than {MAX_USERNAME_LENGTH} characters"
                ));
            }
            if !username.chars().all(is_allowed_username_char) {
                warnings.push(format!("username {username:?} contains unusual characters"));
            }
            if !seen.insert(username.as_str()) {
                warnings.push(format!("username {username:?} is listed more than once"));
            }
        }

        UsernameValidation {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Returns warnings about a user's normalized vehicles.
    pub fn validate_provider_response(&self, username: &str, vehicles: &[Vehicle]) -> Vec<String> {
        let mut warnings = Vec::new();
        for (index, vehicle) in vehicles.iter().enumerate() {
            let label = if vehicle.device_id.is_empty() {
                format!("vehicle #{index} of {username}")
            } else {
                format!("vehicle {} of {username}", vehicle.device_id)
            };

            if vehicle.device_id.trim().is_empty() {
                warnings.push(format!("{label} has no device id"));
            }
            if vehicle.name.trim().is_empty() {
                warnings.push(format!("{label} has no name"));
            }

            let Some(position) = &vehicle.position else {
                continue;
            };
            if !(-90.0..=90.0).contains(&position.latitude) {
                warnings.push(format!("{label} has latitude {} out of range", position.latitude));
            }
            if !(-180.0..=180.0).contains(&position.longitude) {
                warnings.push(format!(
                    "{label} has longitude {} out of range",
                    position.longitude
                ));
            }
            if let Some(speed) = position.speed.filter(|speed| speed.is_nan() || *speed < 0.0) {
                warnings.push(format!("{label} has invalid speed {speed}"));
            }
        }
        warnings
    }
}
