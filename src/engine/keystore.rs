//! Operator API keys
//!
//! Keys look like `dvf_<32 hex>`. Only a base64 SHA-256 digest of each key is
//! written to the key file, so the raw value is shown once at creation.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

const KEY_PREFIX: &str = "dvf_";
const KEY_FILE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("key file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("key file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
    #[error("key file version {0} is newer than this build")]
    UnsupportedVersion(u32),
    #[error("Key name must not be empty")]
    EmptyName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorKey {
    pub id: String,
    pub name: String,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    keys: Vec<OperatorKey>,
}

impl Default for KeyFile {
    fn default() -> Self {
        Self {
            version: KEY_FILE_VERSION,
            keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Keystore {
    path: PathBuf,
}

impl Keystore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Generate a new operator key. The raw key is returned once and never stored.
    pub fn create_api_key(&self, name: &str) -> Result<(String, OperatorKey), KeystoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(KeystoreError::EmptyName);
        }

        let raw_key = format!("{KEY_PREFIX}{}", Uuid::new_v4().simple());
        let key = OperatorKey {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            key_hash: digest(&raw_key),
            created_at: Utc::now(),
        };

        let mut file = self.read()?;
        file.keys.push(key.clone());
        self.write(&file)?;

        tracing::info!(key_id = %key.id, name = %key.name, "operator key created");
        Ok((raw_key, key))
    }

    /// The key matching a presented bearer token, if any
    pub fn validate_api_key(&self, raw_key: &str) -> Result<Option<OperatorKey>, KeystoreError> {
        if !raw_key.starts_with(KEY_PREFIX) {
            return Ok(None);
        }
        let presented = digest(raw_key);
        Ok(self.read()?.keys.into_iter().find(|k| k.key_hash == presented))
    }

    /// Revoke by id. Returns false when no key matched.
    pub fn revoke_api_key(&self, key_id: &str) -> Result<bool, KeystoreError> {
        let mut file = self.read()?;
        let Some(index) = file.keys.iter().position(|k| k.id == key_id) else {
            return Ok(false);
        };
        let revoked = file.keys.remove(index);
        self.write(&file)?;
        tracing::info!(key_id, name = %revoked.name, "operator key revoked");
        Ok(true)
    }

    pub fn list_api_keys(&self) -> Result<Vec<OperatorKey>, KeystoreError> {
        Ok(self.read()?.keys)
    }

    fn read(&self) -> Result<KeyFile, KeystoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(KeyFile::default()),
            Err(source) => return Err(self.io_error(source)),
        };
        let file: KeyFile = serde_json::from_str(&content)?;
        if file.version > KEY_FILE_VERSION {
            return Err(KeystoreError::UnsupportedVersion(file.version));
        }
        Ok(file)
    }

    fn write(&self, file: &KeyFile) -> Result<(), KeystoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let staged = self.path.with_extension("json.tmp");
        fs::write(&staged, serde_json::to_vec_pretty(file)?).map_err(|e| self.io_error(e))?;
        fs::rename(&staged, &self.path).map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: std::io::Error) -> KeystoreError {
        KeystoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn digest(raw_key: &str) -> String {
    BASE64.encode(Sha256::digest(raw_key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_validate_revoke() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::new(&dir.path().join("data").join("keys.json"));

        let (raw, key) = keystore.create_api_key("ci").unwrap();
        assert!(raw.starts_with(KEY_PREFIX));

        let found = keystore.validate_api_key(&raw).unwrap().unwrap();
        assert_eq!(found.id, key.id);
        assert!(keystore.validate_api_key("dvf_wrong").unwrap().is_none());
        assert!(keystore.validate_api_key("").unwrap().is_none());

        assert!(keystore.revoke_api_key(&key.id).unwrap());
        assert!(!keystore.revoke_api_key(&key.id).unwrap());
        assert!(keystore.validate_api_key(&raw).unwrap().is_none());
    }

    #[test]
    fn test_raw_key_not_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let keystore = Keystore::new(&path);

        let (raw, _) = keystore.create_api_key("laptop").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains(&raw));
        assert_eq!(keystore.list_api_keys().unwrap().len(), 1);
    }

    #[test]
    fn test_newer_key_file_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, r#"{"version": 9, "keys": []}"#).unwrap();
        assert!(matches!(
            Keystore::new(&path).list_api_keys(),
            Err(KeystoreError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_empty_name_rejected() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::new(&dir.path().join("keys.json"));
        assert!(matches!(
            keystore.create_api_key("  "),
            Err(KeystoreError::EmptyName)
        ));
    }
}
