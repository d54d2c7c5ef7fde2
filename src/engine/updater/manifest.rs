//! Protected-Path Manifest
//!
//! Paths an update must never ship or overwrite: credentials, local
//! configuration and device identity. Entries are relative to the application
//! root. A plain entry protects that path and everything beneath it; an entry
//! of the form `*.ext` protects every file with that extension.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use thiserror::Error;

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// VCS and build directory names never shipped and never cleaned, at any depth
pub const UNSHIPPED_DIRS: &[&str] = &[".git", "target", "__pycache__", "node_modules"];

/// Whether any directory component of `relative` is an unshipped directory
pub fn in_unshipped_dir(relative: &Path) -> bool {
    let mut dirs = relative.components().rev().skip(1);
    dirs.any(|c| match c {
        Component::Normal(name) => name.to_str().is_some_and(|n| UNSHIPPED_DIRS.contains(&n)),
        _ => false,
    })
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid manifest format: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Unsupported manifest version {0}")]
    UnsupportedVersion(u32),
    #[error("Manifest entry must be a relative path inside the app: {0}")]
    InvalidEntry(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedManifest {
    pub version: u32,
    pub paths: Vec<String>,
}

impl Default for ProtectedManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            paths: [
                ".env",
                "credentials",
                "secrets",
                "config.json",
                "devfleet.config.json",
                "device.json",
                "agent-state",
                "*.pem",
                "*.key",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
        }
    }
}

impl ProtectedManifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        let manifest: ProtectedManifest = serde_json::from_str(&content)?;
        if manifest.version > MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion(manifest.version));
        }
        for entry in &manifest.paths {
            validate_entry(entry)?;
        }
        Ok(manifest)
    }

    /// Add one more protected relative path
    pub fn with_path(mut self, path: &str) -> Result<Self, ManifestError> {
        validate_entry(path)?;
        if !self.paths.iter().any(|p| p == path) {
            self.paths.push(path.to_string());
        }
        Ok(self)
    }

    pub fn is_protected(&self, relative: &Path) -> bool {
        self.paths.iter().any(|entry| {
            if let Some(ext) = entry.strip_prefix("*.") {
                relative.extension().is_some_and(|e| e == ext)
            } else {
                relative.starts_with(entry)
            }
        })
    }
}

fn validate_entry(entry: &str) -> Result<(), ManifestError> {
    if let Some(ext) = entry.strip_prefix("*.") {
        if ext.is_empty() || ext.contains(['/', '\\', '*']) {
            return Err(ManifestError::InvalidEntry(entry.to_string()));
        }
        return Ok(());
    }
    let path = Path::new(entry);
    let relative = !entry.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if relative {
        Ok(())
    } else {
        Err(ManifestError::InvalidEntry(entry.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_protects_credentials() {
        let manifest = ProtectedManifest::default();
        assert!(manifest.is_protected(Path::new(".env")));
        assert!(manifest.is_protected(Path::new("credentials/google.json")));
        assert!(manifest.is_protected(Path::new("certs/device.pem")));
        assert!(!manifest.is_protected(Path::new("src/main.py")));
        // Prefix match is by component, not by string
        assert!(!manifest.is_protected(Path::new("credentials_helper.py")));
    }

    #[test]
    fn test_unshipped_dir_components() {
        assert!(in_unshipped_dir(Path::new(".git/HEAD")));
        assert!(in_unshipped_dir(Path::new("web/node_modules/x/index.js")));
        assert!(!in_unshipped_dir(Path::new("src/target.py")));
        // A file named like a directory is still shipped
        assert!(!in_unshipped_dir(Path::new("target")));
    }

    #[test]
    fn test_load_rejects_escaping_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("protected.json");

        std::fs::write(&path, r#"{"version": 1, "paths": ["../etc/passwd"]}"#).unwrap();
        assert!(matches!(
            ProtectedManifest::load(&path),
            Err(ManifestError::InvalidEntry(_))
        ));

        std::fs::write(&path, r#"{"version": 1, "paths": ["/etc"]}"#).unwrap();
        assert!(ProtectedManifest::load(&path).is_err());

        std::fs::write(&path, r#"{"version": 9, "paths": []}"#).unwrap();
        assert!(matches!(
            ProtectedManifest::load(&path),
            Err(ManifestError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_with_path() {
        let manifest = ProtectedManifest::default().with_path("state").unwrap();
        assert!(manifest.is_protected(Path::new("state/agent.json")));
        assert!(ProtectedManifest::default().with_path("../state").is_err());
    }
}
