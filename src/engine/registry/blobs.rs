//! Package Blob Store
//!
//! One file per object key. Writes land in a temp file, are synced, then
//! renamed into place so a key never points at a partial blob.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn open(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> io::Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid object key: {key}"),
            ));
        }
        Ok(self.root.join(key))
    }

    /// Durably store `bytes` under `key`, replacing any previous object
    pub fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let final_path = self.key_path(key)?;
        let temp_path = self
            .root
            .join(format!(".tmp-{}-{}", key, uuid::Uuid::new_v4()));

        let result = (|| -> io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&temp_path, &final_path)?;
            // Make the rename itself durable
            #[cfg(unix)]
            File::open(&self.root)?.sync_all()?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    pub fn get(&self, key: &str) -> io::Result<Vec<u8>> {
        fs::read(self.key_path(key)?)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.key_path(key).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn remove(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.key_path(key)?) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_replace() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        store.put("v1.0.0", b"first").unwrap();
        assert!(store.exists("v1.0.0"));
        assert_eq!(store.get("v1.0.0").unwrap(), b"first");

        store.put("v1.0.0", b"second").unwrap();
        assert_eq!(store.get("v1.0.0").unwrap(), b"second");

        // No temp files left behind
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["v1.0.0".to_string()]);
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        assert!(store.put("../escape", b"x").is_err());
        assert!(store.put(".hidden", b"x").is_err());
        assert!(!store.exists("a/b"));
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        assert!(store.remove("v9.9.9").is_ok());
    }
}
