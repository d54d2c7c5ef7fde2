//! Update Registry
//!
//! Published updates are immutable. A package blob is durably stored before
//! its metadata row is inserted, so readers never see a record without a blob.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::blobs::BlobStore;
use super::error::{RegistryError, Result};
use crate::engine::database::Database;
use crate::engine::models::{UpdatePolicy, UpdateRecord};
use crate::engine::version::{Version, VersionParseError};

const UPDATE_COLUMNS: &str = "version, description, created_at, requires_system_packages, \
     system_packages, policy, package_checksum, package_size";

/// Input to [`UpdateRegistry::create_update`]
#[derive(Debug, Clone)]
pub struct NewUpdate {
    pub version: String,
    pub description: String,
    /// Derived from `system_packages` when `None`
    pub requires_system_packages: Option<bool>,
    pub system_packages: Vec<String>,
    pub policy: UpdatePolicy,
    pub package: Vec<u8>,
}

/// Lowercase hex SHA-256
pub fn package_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Clone)]
pub struct UpdateRegistry {
    db: Database,
    blobs: BlobStore,
    publish_locks: Arc<Mutex<HashMap<Version, Arc<Mutex<()>>>>>,
}

impl UpdateRegistry {
    pub fn new(db: Database, blobs: BlobStore) -> Self {
        Self {
            db,
            blobs,
            publish_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish a new update. Racing calls for one version yield one winner.
    pub fn create_update(&self, new: NewUpdate) -> Result<UpdateRecord> {
        let version = Version::parse(&new.version)?;
        let precedence = sql_precedence(&version, &new.version)?;
        let requires_system_packages =
            check_system_packages(new.requires_system_packages, &new.system_packages)?;
        if new.package.is_empty() {
            return Err(RegistryError::EmptyPackage);
        }

        self.with_version_lock(version, || {
            self.store_new(version, precedence, requires_system_packages, new)
        })
    }

    fn store_new(
        &self,
        version: Version,
        precedence: (i64, i64, i64),
        requires_system_packages: bool,
        new: NewUpdate,
    ) -> Result<UpdateRecord> {
        if self.find(&version)?.is_some() {
            return Err(RegistryError::DuplicateVersion(version.to_string()));
        }

        let key = version.to_string();
        let record = UpdateRecord {
            version,
            description: new.description,
            created_at: Utc::now(),
            requires_system_packages,
            system_packages: new.system_packages,
            policy: new.policy,
            package_checksum: package_checksum(&new.package),
            package_size: new.package.len() as u64,
        };

        // No row exists for this key, so any blob already stored is an orphan
        // from an interrupted publish and may be replaced.
        self.blobs.put(&key, &new.package)?;

        if let Err(e) = self.insert(&record, precedence) {
            let _ = self.blobs.remove(&key);
            return Err(match e {
                RegistryError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    RegistryError::DuplicateVersion(key)
                }
                other => other,
            });
        }

        tracing::info!(
            version = %record.version,
            checksum = %record.package_checksum,
            size = record.package_size,
            policy = %record.policy,
            "update published"
        );
        Ok(record)
    }

    /// Highest version by numeric precedence
    pub fn get_latest(&self) -> Result<UpdateRecord> {
        let conn = self.db.get_connection()?;
        conn.query_row(
            &format!(
                "SELECT {UPDATE_COLUMNS} FROM updates
                 ORDER BY major DESC, minor DESC, patch DESC LIMIT 1"
            ),
            [],
            row_to_update,
        )
        .optional()
        .map_err(map_row_error)?
        .ok_or_else(|| RegistryError::NotFound("no updates published".to_string()))
    }

    pub fn get_by_version(&self, version: &str) -> Result<UpdateRecord> {
        let parsed = Version::parse(version)?;
        self.find(&parsed)?
            .ok_or_else(|| RegistryError::NotFound(parsed.to_string()))
    }

    /// All updates, newest first
    pub fn list(&self) -> Result<Vec<UpdateRecord>> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {UPDATE_COLUMNS} FROM updates ORDER BY major DESC, minor DESC, patch DESC"
        ))?;
        let updates = stmt
            .query_map([], row_to_update)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(map_row_error)?;
        Ok(updates)
    }

    /// Package bytes for a published version
    pub fn read_package(&self, version: &str) -> Result<(UpdateRecord, Vec<u8>)> {
        let record = self.get_by_version(version)?;
        let bytes = self.blobs.get(&record.version.to_string())?;
        Ok((record, bytes))
    }

    /// Run `f` holding the publish lock for `version`. The map entry is
    /// dropped again once no other publish of that version is waiting.
    fn with_version_lock<T>(&self, version: Version, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = {
            let mut locks = self.publish_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(version).or_default().clone()
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };

        let mut locks = self.publish_locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&version);
        }
        result
    }

    fn find(&self, version: &Version) -> Result<Option<UpdateRecord>> {
        let conn = self.db.get_connection()?;
        conn.query_row(
            &format!("SELECT {UPDATE_COLUMNS} FROM updates WHERE version = ?1"),
            [version.to_string()],
            row_to_update,
        )
        .optional()
        .map_err(map_row_error)
    }

    fn insert(&self, record: &UpdateRecord, precedence: (i64, i64, i64)) -> Result<()> {
        let packages = serde_json::to_string(&record.system_packages)
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        let conn = self.db.get_connection()?;
        conn.execute(
            "INSERT INTO updates
                (version, major, minor, patch, description, created_at,
                 requires_system_packages, system_packages, policy, package_checksum, package_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.version.to_string(),
                precedence.0,
                precedence.1,
                precedence.2,
                record.description,
                record.created_at.to_rfc3339(),
                record.requires_system_packages,
                packages,
                record.policy.as_str(),
                record.package_checksum,
                record.package_size as i64,
            ],
        )?;
        Ok(())
    }
}

/// SQLite integers are signed; larger components cannot be ordered there.
fn sql_precedence(version: &Version, raw: &str) -> Result<(i64, i64, i64)> {
    let convert = |n: u64| i64::try_from(n).map_err(|_| VersionParseError(raw.to_string()));
    Ok((
        convert(version.major)?,
        convert(version.minor)?,
        convert(version.patch)?,
    ))
}

/// Resolve `requires_system_packages` against the declared package list
pub fn check_system_packages(requires: Option<bool>, packages: &[String]) -> Result<bool> {
    for name in packages {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidPackageList(format!(
                "invalid package name {name:?}"
            )));
        }
    }
    match requires {
        Some(true) if packages.is_empty() => Err(RegistryError::InvalidPackageList(
            "requires_system_packages is set but no packages are listed".to_string(),
        )),
        Some(false) if !packages.is_empty() => Err(RegistryError::InvalidPackageList(
            "packages are listed but requires_system_packages is false".to_string(),
        )),
        _ => Ok(!packages.is_empty()),
    }
}

fn corrupt(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, message.into())
}

fn map_row_error(e: rusqlite::Error) -> RegistryError {
    match e {
        rusqlite::Error::FromSqlConversionFailure(_, _, inner) => {
            RegistryError::Corrupt(inner.to_string())
        }
        other => RegistryError::Sqlite(other),
    }
}

fn row_to_update(row: &Row<'_>) -> rusqlite::Result<UpdateRecord> {
    let version: String = row.get(0)?;
    let created_at: String = row.get(2)?;
    let packages: String = row.get(4)?;
    let policy: String = row.get(5)?;
    let size: i64 = row.get(7)?;

    Ok(UpdateRecord {
        version: Version::parse(&version).map_err(|e| corrupt(e.to_string()))?,
        description: row.get(1)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(e.to_string()))?,
        requires_system_packages: row.get(3)?,
        system_packages: serde_json::from_str(&packages).map_err(|e| corrupt(e.to_string()))?,
        policy: policy
            .parse()
            .map_err(|p| corrupt(format!("unknown policy {p}")))?,
        package_checksum: row.get(6)?,
        package_size: size.max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn registry() -> (TempDir, UpdateRegistry) {
        let dir = tempdir().unwrap();
        let blobs = BlobStore::open(&dir.path().join("blobs")).unwrap();
        (dir, UpdateRegistry::new(Database::in_memory().unwrap(), blobs))
    }

    fn new_update(version: &str) -> NewUpdate {
        NewUpdate {
            version: version.to_string(),
            description: format!("release {version}"),
            requires_system_packages: None,
            system_packages: Vec::new(),
            policy: UpdatePolicy::Scheduled,
            package: format!("package {version}").into_bytes(),
        }
    }

    #[test]
    fn test_create_then_get_roundtrip() {
        let (_dir, registry) = registry();
        let created = registry.create_update(new_update("v1.0.0")).unwrap();

        let fetched = registry.get_by_version("v1.0.0").unwrap();
        assert_eq!(fetched.description, "release v1.0.0");
        assert_eq!(fetched.package_checksum, created.package_checksum);
        assert_eq!(fetched.package_checksum, package_checksum(b"package v1.0.0"));
        assert_eq!(fetched.package_size, 14);

        let (_, bytes) = registry.read_package("v1.0.0").unwrap();
        assert_eq!(bytes, b"package v1.0.0");
    }

    #[test]
    fn test_invalid_version_has_no_side_effects() {
        let (dir, registry) = registry();
        for raw in ["1.0.0", "v1.0", "latest", "v1.0.0-rc1"] {
            let err = registry.create_update(new_update(raw)).unwrap_err();
            assert!(matches!(err, RegistryError::InvalidVersion(_)), "{raw}");
        }
        assert!(registry.list().unwrap().is_empty());
        assert_eq!(
            std::fs::read_dir(dir.path().join("blobs")).unwrap().count(),
            0
        );
    }

    #[test]
    fn test_duplicate_version_never_mutates() {
        let (_dir, registry) = registry();
        let original = registry.create_update(new_update("v1.0.0")).unwrap();

        let mut second = new_update("v1.0.0");
        second.description = "overwrite attempt".to_string();
        second.package = b"different bytes".to_vec();
        let err = registry.create_update(second).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateVersion(_)));

        assert_eq!(registry.get_by_version("v1.0.0").unwrap(), original);
        let (_, bytes) = registry.read_package("v1.0.0").unwrap();
        assert_eq!(bytes, b"package v1.0.0");
    }

    #[test]
    fn test_latest_uses_numeric_precedence() {
        let (_dir, registry) = registry();
        for version in ["v1.9.9", "v2.0.0", "v1.10.0"] {
            registry.create_update(new_update(version)).unwrap();
        }
        assert_eq!(registry.get_latest().unwrap().version, Version::new(2, 0, 0));

        // Publishing an older version afterwards does not move "latest"
        registry.create_update(new_update("v1.11.0")).unwrap();
        assert_eq!(registry.get_latest().unwrap().version, Version::new(2, 0, 0));

        let order: Vec<_> = registry
            .list()
            .unwrap()
            .into_iter()
            .map(|u| u.version.to_string())
            .collect();
        assert_eq!(order, vec!["v2.0.0", "v1.11.0", "v1.10.0", "v1.9.9"]);
    }

    #[test]
    fn test_latest_when_empty() {
        let (_dir, registry) = registry();
        assert!(matches!(
            registry.get_latest(),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_system_package_rules() {
        let (_dir, registry) = registry();

        let mut with_packages = new_update("v1.0.0");
        with_packages.system_packages = vec!["ffmpeg".to_string(), "libasound2".to_string()];
        let record = registry.create_update(with_packages).unwrap();
        assert!(record.requires_system_packages);

        let mut claims_without_list = new_update("v1.0.1");
        claims_without_list.requires_system_packages = Some(true);
        assert!(matches!(
            registry.create_update(claims_without_list),
            Err(RegistryError::InvalidPackageList(_))
        ));

        let mut bad_name = new_update("v1.0.2");
        bad_name.system_packages = vec!["rm -rf".to_string()];
        assert!(matches!(
            registry.create_update(bad_name),
            Err(RegistryError::InvalidPackageList(_))
        ));
    }

    #[test]
    fn test_empty_package_rejected() {
        let (_dir, registry) = registry();
        let mut empty = new_update("v1.0.0");
        empty.package.clear();
        assert!(matches!(
            registry.create_update(empty),
            Err(RegistryError::EmptyPackage)
        ));
    }

    #[test]
    fn test_racing_publishes_have_one_winner() {
        let (_dir, registry) = registry();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut update = new_update("v3.0.0");
                    update.description = format!("racer {i}");
                    update.package = format!("bytes from racer {i}").into_bytes();
                    registry.create_update(update)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, RegistryError::DuplicateVersion(_))));

        // The stored blob belongs to the winner
        let (record, bytes) = registry.read_package("v3.0.0").unwrap();
        assert_eq!(record.package_checksum, package_checksum(&bytes));
        assert_eq!(record.description, winners[0].description);
        assert!(registry.publish_locks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_publish_locks_released() {
        let (_dir, registry) = registry();

        registry.create_update(new_update("v1.0.0")).unwrap();
        assert!(matches!(
            registry.create_update(new_update("v1.0.0")),
            Err(RegistryError::DuplicateVersion(_))
        ));
        let mut empty = new_update("v1.1.0");
        empty.package.clear();
        assert!(registry.create_update(empty).is_err());

        assert!(registry.publish_locks.lock().unwrap().is_empty());
    }
}
