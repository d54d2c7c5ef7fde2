//! Device Registry
//!
//! Registration is the only authorization gate for devices: a uuid that was
//! registered and is not disabled may heartbeat and check for updates.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeMap;

use super::error::{RegistryError, Result};
use crate::engine::database::Database;
use crate::engine::models::{Device, DeviceStatus, HeartbeatRequest, RegisterRequest};
use crate::engine::version::Version;

const DEVICE_COLUMNS: &str =
    "uuid, display_name, timezone, status, current_version, last_seen, metadata, created_at";

/// Accepts the canonical 8-4-4-4-12 hex form only.
pub fn is_valid_uuid(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() == 36
        && bytes.iter().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

fn normalize_uuid(raw: &str) -> Result<String> {
    if !is_valid_uuid(raw) {
        return Err(RegistryError::InvalidUuid(raw.to_string()));
    }
    Ok(raw.to_ascii_lowercase())
}

#[derive(Clone)]
pub struct DeviceRegistry {
    db: Database,
}

impl DeviceRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a device. Returns the stored record and whether it was created.
    ///
    /// Re-registering an existing uuid returns the original record untouched.
    pub fn register(&self, request: &RegisterRequest) -> Result<(Device, bool)> {
        let uuid = normalize_uuid(&request.uuid)?;
        if request.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(RegistryError::InvalidTimezone(request.timezone.clone()));
        }

        let conn = self.db.get_connection()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO devices
                (uuid, display_name, timezone, status, current_version, last_seen, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)",
            params![
                uuid,
                request.display_name,
                request.timezone,
                DeviceStatus::Offline.as_str(),
                Version::SENTINEL.to_string(),
                encode_metadata(&request.metadata)?,
                Utc::now().to_rfc3339(),
            ],
        )?;

        let device = conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE uuid = ?1"),
                [&uuid],
                row_to_device,
            )
            .map_err(map_row_error)?;

        Ok((device, inserted == 1))
    }

    pub fn lookup(&self, uuid: &str) -> Result<Device> {
        let uuid = normalize_uuid(uuid)?;
        self.find(&uuid)?
            .ok_or_else(|| RegistryError::NotFound(uuid))
    }

    /// Gate for device-facing calls: the uuid must be registered and enabled.
    pub fn authorize(&self, uuid: &str) -> Result<Device> {
        let uuid = normalize_uuid(uuid)?;
        let device = self
            .find(&uuid)?
            .ok_or_else(|| RegistryError::UnknownDevice(uuid.clone()))?;
        if device.status == DeviceStatus::Disabled {
            return Err(RegistryError::Forbidden(uuid));
        }
        Ok(device)
    }

    /// Record a status report. Last writer wins.
    pub fn heartbeat(&self, uuid: &str, report: &HeartbeatRequest) -> Result<Device> {
        let uuid = normalize_uuid(uuid)?;
        let version = Version::parse(&report.current_version)?;
        if report.status == DeviceStatus::Disabled {
            return Err(RegistryError::InvalidStatus(
                "devices cannot report themselves disabled".to_string(),
            ));
        }

        let mut conn = self.db.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE uuid = ?1"),
                [&uuid],
                row_to_device,
            )
            .optional()
            .map_err(map_row_error)?
            .ok_or_else(|| RegistryError::UnknownDevice(uuid.clone()))?;

        if existing.status == DeviceStatus::Disabled {
            return Err(RegistryError::Forbidden(uuid));
        }

        let mut metadata = existing.metadata;
        metadata.extend(report.metadata.clone());

        let now = Utc::now();
        tx.execute(
            "UPDATE devices
             SET status = ?2, current_version = ?3, last_seen = ?4, metadata = ?5
             WHERE uuid = ?1",
            params![
                uuid,
                report.status.as_str(),
                version.to_string(),
                now.to_rfc3339(),
                encode_metadata(&metadata)?,
            ],
        )?;
        tx.commit()?;

        Ok(Device {
            status: report.status,
            current_version: version,
            last_seen: Some(now),
            metadata,
            ..existing
        })
    }

    /// Disable a device. Later heartbeats and update checks are refused.
    pub fn deactivate(&self, uuid: &str) -> Result<Device> {
        self.set_admin_status(uuid, DeviceStatus::Disabled, None)
    }

    /// Re-enable a disabled device. Other statuses are left alone.
    pub fn reactivate(&self, uuid: &str) -> Result<Device> {
        self.set_admin_status(uuid, DeviceStatus::Offline, Some(DeviceStatus::Disabled))
    }

    pub fn list(&self) -> Result<Vec<Device>> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY display_name, uuid"
        ))?;
        let devices = stmt
            .query_map([], row_to_device)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(map_row_error)?;
        Ok(devices)
    }

    fn set_admin_status(
        &self,
        uuid: &str,
        status: DeviceStatus,
        only_from: Option<DeviceStatus>,
    ) -> Result<Device> {
        let uuid = normalize_uuid(uuid)?;
        let conn = self.db.get_connection()?;
        let changed = match only_from {
            Some(from) => conn.execute(
                "UPDATE devices SET status = ?2 WHERE uuid = ?1 AND status = ?3",
                params![uuid, status.as_str(), from.as_str()],
            )?,
            None => conn.execute(
                "UPDATE devices SET status = ?2 WHERE uuid = ?1",
                params![uuid, status.as_str()],
            )?,
        };
        drop(conn);

        let device = self
            .find(&uuid)?
            .ok_or_else(|| RegistryError::NotFound(uuid.clone()))?;
        if changed > 0 {
            tracing::info!(uuid = %device.uuid, status = %device.status, "device status changed by operator");
        }
        Ok(device)
    }

    fn find(&self, uuid: &str) -> Result<Option<Device>> {
        let conn = self.db.get_connection()?;
        conn.query_row(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE uuid = ?1"),
            [uuid],
            row_to_device,
        )
        .optional()
        .map_err(map_row_error)
    }
}

fn encode_metadata(metadata: &BTreeMap<String, serde_json::Value>) -> Result<String> {
    serde_json::to_string(metadata).map_err(|e| RegistryError::Corrupt(e.to_string()))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(e.to_string()))
}

/// Decoding failures inside a row mapper surface as this variant.
fn corrupt(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn map_row_error(e: rusqlite::Error) -> RegistryError {
    match e {
        rusqlite::Error::FromSqlConversionFailure(_, _, inner) => {
            RegistryError::Corrupt(inner.to_string())
        }
        other => RegistryError::Sqlite(other),
    }
}

fn row_to_device(row: &Row<'_>) -> rusqlite::Result<Device> {
    let status: String = row.get(3)?;
    let version: String = row.get(4)?;
    let last_seen: Option<String> = row.get(5)?;
    let metadata: String = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok(Device {
        uuid: row.get(0)?,
        display_name: row.get(1)?,
        timezone: row.get(2)?,
        status: status
            .parse()
            .map_err(|s| corrupt(format!("unknown status {s}")))?,
        current_version: Version::parse(&version).map_err(|e| corrupt(e.to_string()))?,
        last_seen: last_seen.as_deref().map(parse_time).transpose()?,
        metadata: serde_json::from_str(&metadata).map_err(|e| corrupt(e.to_string()))?,
        created_at: parse_time(&created_at)?,
    })
}
