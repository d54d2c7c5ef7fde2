//! Version Manager
//!
//! Owns the on-device layout: the managed application tree with its `VERSION`
//! marker, and the agent state directory holding downloads, staging trees,
//! persisted state and the restart marker.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::version::Version;

/// Version marker file at the root of the application tree and of every package
pub const VERSION_MARKER: &str = "VERSION";
/// System package declaration at the root of every package
pub const SYSTEM_PACKAGES_FILE: &str = "system-packages.txt";
/// Files the installed package shipped, one relative path per line
pub const SHIPPED_LIST: &str = ".devfleet-files";

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Package has no VERSION marker")]
    MissingMarker,
    #[error("Package marker says {found}, expected {expected}")]
    MarkerMismatch { expected: Version, found: String },
}

pub struct VersionManager {
    app_dir: PathBuf,
    state_dir: PathBuf,
}

impl VersionManager {
    pub fn new(app_dir: &Path, state_dir: &Path) -> Self {
        Self {
            app_dir: app_dir.to_path_buf(),
            state_dir: state_dir.to_path_buf(),
        }
    }

    pub fn init(&self) -> Result<(), VersionError> {
        fs::create_dir_all(&self.app_dir)?;
        fs::create_dir_all(self.downloads_dir())?;
        fs::create_dir_all(self.staging_root())?;
        Ok(())
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.state_dir.join("downloads")
    }

    fn staging_root(&self) -> PathBuf {
        self.state_dir.join("staging")
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn restart_marker_path(&self) -> PathBuf {
        self.state_dir.join("restart.requested")
    }

    pub fn activity_path(&self) -> PathBuf {
        self.state_dir.join("activity.stamp")
    }

    pub fn package_path(&self, version: &Version) -> PathBuf {
        self.downloads_dir().join(format!("{}.tar.gz", version))
    }

    pub fn staging_path(&self, version: &Version) -> PathBuf {
        self.staging_root().join(format!(".tmp-{}", version))
    }

    /// Installed version. A missing marker means the app was never updated.
    pub fn local_version(&self) -> Result<Version, VersionError> {
        let marker = self.app_dir.join(VERSION_MARKER);
        let content = match fs::read_to_string(&marker) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Version::SENTINEL),
            Err(e) => return Err(e.into()),
        };
        match Version::parse(content.trim()) {
            Ok(version) => Ok(version),
            Err(e) => {
                // An unreadable marker gets replaced by the next install
                tracing::warn!(marker = %marker.display(), error = %e, "ignoring malformed version marker");
                Ok(Version::SENTINEL)
            }
        }
    }

    /// Unpack a verified package into a fresh staging tree and check its marker
    pub fn stage(&self, package: &Path, version: &Version) -> Result<PathBuf, VersionError> {
        let staging = self.staging_path(version);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let result = (|| -> Result<(), VersionError> {
            let mut archive = tar::Archive::new(GzDecoder::new(File::open(package)?));
            // Entries escaping the staging root are refused by unpack
            archive.unpack(&staging)?;

            let marker = staging.join(VERSION_MARKER);
            if !marker.is_file() {
                return Err(VersionError::MissingMarker);
            }
            let found = fs::read_to_string(&marker)?.trim().to_string();
            if found != version.to_string() {
                return Err(VersionError::MarkerMismatch {
                    expected: *version,
                    found,
                });
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(staging),
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(e)
            }
        }
    }

    pub fn remove_package(&self, version: &Version) {
        let _ = fs::remove_file(self.package_path(version));
    }

    /// Clean up staging trees and partial downloads from interrupted cycles
    pub fn cleanup_temp(&self) -> Result<(), VersionError> {
        for dir in [self.staging_root(), self.downloads_dir()] {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::tempdir;

    /// Build a gzip tarball from `(path, contents)` pairs
    pub(crate) fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_local_version_from_marker() {
        let dir = tempdir().unwrap();
        let vm = VersionManager::new(&dir.path().join("app"), &dir.path().join("state"));
        vm.init().unwrap();

        assert_eq!(vm.local_version().unwrap(), Version::SENTINEL);

        fs::write(dir.path().join("app").join(VERSION_MARKER), "v1.2.3\n").unwrap();
        assert_eq!(vm.local_version().unwrap(), Version::new(1, 2, 3));

        fs::write(dir.path().join("app").join(VERSION_MARKER), "garbage").unwrap();
        assert_eq!(vm.local_version().unwrap(), Version::SENTINEL);
    }

    #[test]
    fn test_stage_checks_marker() {
        let dir = tempdir().unwrap();
        let vm = VersionManager::new(&dir.path().join("app"), &dir.path().join("state"));
        vm.init().unwrap();
        let version = Version::new(1, 0, 0);

        let package = vm.package_path(&version);
        fs::write(
            &package,
            tarball(&[("VERSION", "v1.0.0\n"), ("src/main.py", "print(1)")]),
        )
        .unwrap();
        let staged = vm.stage(&package, &version).unwrap();
        assert_eq!(fs::read(staged.join("src/main.py")).unwrap(), b"print(1)");

        fs::write(&package, tarball(&[("VERSION", "v0.9.0\n")])).unwrap();
        assert!(matches!(
            vm.stage(&package, &version),
            Err(VersionError::MarkerMismatch { .. })
        ));
        assert!(!vm.staging_path(&version).exists());

        fs::write(&package, tarball(&[("main.py", "x")])).unwrap();
        assert!(matches!(
            vm.stage(&package, &version),
            Err(VersionError::MissingMarker)
        ));
    }

    #[test]
    fn test_cleanup_temp() {
        let dir = tempdir().unwrap();
        let vm = VersionManager::new(&dir.path().join("app"), &dir.path().join("state"));
        vm.init().unwrap();
        let version = Version::new(2, 0, 0);

        fs::create_dir_all(vm.staging_path(&version)).unwrap();
        fs::write(vm.package_path(&version).with_extension("partial"), b"x").unwrap();
        vm.cleanup_temp().unwrap();

        assert_eq!(fs::read_dir(vm.downloads_dir()).unwrap().count(), 0);
        assert!(!vm.staging_path(&version).exists());
    }
}
