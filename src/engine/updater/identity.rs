//! Device identity
//!
//! The uuid is generated once on the device and kept in the state directory,
//! unless the configuration pins one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::engine::registry::devices::is_valid_uuid;

pub const IDENTITY_FILE: &str = "device.json";

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid identity file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid device UUID: {0}")]
    InvalidUuid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub uuid: String,
    pub created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Configured uuid first, then the persisted one, else a new one is saved
    pub fn resolve(configured: Option<&str>, state_dir: &Path) -> Result<Self, IdentityError> {
        if let Some(uuid) = configured {
            if !is_valid_uuid(uuid) {
                return Err(IdentityError::InvalidUuid(uuid.to_string()));
            }
            return Ok(Self {
                uuid: uuid.to_ascii_lowercase(),
                created_at: Utc::now(),
            });
        }

        let path = state_dir.join(IDENTITY_FILE);
        if path.exists() {
            let identity: DeviceIdentity = serde_json::from_str(&fs::read_to_string(&path)?)?;
            if !is_valid_uuid(&identity.uuid) {
                return Err(IdentityError::InvalidUuid(identity.uuid));
            }
            return Ok(identity);
        }

        let identity = Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        };
        fs::create_dir_all(state_dir)?;
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, serde_json::to_string_pretty(&identity)?)?;
        fs::rename(&temp, &path)?;
        tracing::info!(uuid = %identity.uuid, "generated device identity");
        Ok(identity)
    }
}
