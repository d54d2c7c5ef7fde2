//! Restart signalling for the external process supervisor

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::install::InstallError;
use crate::engine::version::Version;

pub trait Restarter: Send + Sync {
    fn request_restart(&self, version: &Version) -> Result<(), InstallError>;
}

/// Runs a supervisor command such as `systemctl restart app`
pub struct CommandRestarter {
    command: Vec<String>,
}

impl CommandRestarter {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Restarter for CommandRestarter {
    fn request_restart(&self, version: &Version) -> Result<(), InstallError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| InstallError::Restart("empty restart command".to_string()))?;
        let status = Command::new(program)
            .args(args)
            .env("DEVFLEET_VERSION", version.to_string())
            .status()
            .map_err(|e| InstallError::Restart(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(InstallError::Restart(format!("{} exited with {}", program, status)))
        }
    }
}

/// Leaves a marker file for a supervisor that watches for it
pub struct MarkerRestarter {
    path: PathBuf,
}

impl MarkerRestarter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl Restarter for MarkerRestarter {
    fn request_restart(&self, version: &Version) -> Result<(), InstallError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| InstallError::Restart(e.to_string()))?;
        }
        fs::write(&self.path, format!("{}\n", version))
            .map_err(|e| InstallError::Restart(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_marker_restarter_writes_version() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("state").join("restart.requested");
        MarkerRestarter::new(&marker)
            .request_restart(&Version::new(1, 4, 0))
            .unwrap();
        assert_eq!(fs::read_to_string(marker).unwrap(), "v1.4.0\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_restarter_status() {
        let version = Version::new(1, 0, 0);
        assert!(CommandRestarter::new(vec!["true".to_string()])
            .request_restart(&version)
            .is_ok());
        assert!(CommandRestarter::new(vec!["false".to_string()])
            .request_restart(&version)
            .is_err());
        assert!(CommandRestarter::new(vec![]).request_restart(&version).is_err());
    }
}
