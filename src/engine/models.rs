//! Records exchanged between the registries, the HTTP API and the agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::engine::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Updating,
    Offline,
    Disabled,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Updating => "updating",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(DeviceStatus::Online),
            "updating" => Ok(DeviceStatus::Updating),
            "offline" => Ok(DeviceStatus::Offline),
            "disabled" => Ok(DeviceStatus::Disabled),
            other => Err(other.to_string()),
        }
    }
}

/// A registered device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Device {
    pub uuid: String,
    pub display_name: String,
    pub timezone: String,
    pub status: DeviceStatus,
    #[schema(value_type = String, example = "v1.0.0")]
    pub current_version: Version,
    pub last_seen: Option<DateTime<Utc>>,
    #[schema(value_type = Object)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Distribution-timing policy chosen by the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Install inside the device's daily maintenance window
    #[default]
    Scheduled,
    /// Install once the device has been idle long enough
    Urgent,
}

impl UpdatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdatePolicy::Scheduled => "scheduled",
            UpdatePolicy::Urgent => "urgent",
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(UpdatePolicy::Scheduled),
            "urgent" => Ok(UpdatePolicy::Urgent),
            other => Err(other.to_string()),
        }
    }
}

/// Published update metadata. The package blob is fetched separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UpdateRecord {
    #[schema(value_type = String, example = "v1.0.0")]
    pub version: Version,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub requires_system_packages: bool,
    pub system_packages: Vec<String>,
    pub policy: UpdatePolicy,
    /// Lowercase hex SHA-256 of the package archive
    pub package_checksum: String,
    pub package_size: u64,
}

/// Body of `POST /api/devices`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub uuid: String,
    pub display_name: String,
    pub timezone: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Body of `POST /api/devices/{uuid}/heartbeat`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HeartbeatRequest {
    pub current_version: String,
    pub status: DeviceStatus,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}
