//! Installer
//!
//! Applies a staged package to the application tree:
//! 1. Install declared OS packages; any failure aborts before a file changes.
//! 2. Copy staged files over the app tree, skipping protected paths.
//! 3. Remove files the previous install shipped and the new one does not.
//!    Files no package ever shipped (a virtualenv, `.git`, runtime caches) are
//!    left alone, as is anything under an unshipped directory.
//!
//! The shipped-file list and then the `VERSION` marker are written last, so an
//! interrupted swap still reports the old version and is retried by the next
//! cycle.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use walkdir::WalkDir;

use super::manifest::{in_unshipped_dir, ProtectedManifest};
use super::version_manager::{SHIPPED_LIST, VERSION_MARKER};

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("System package {package} failed to install: {detail}")]
    SystemPackage { package: String, detail: String },
    #[error("File replacement failed at {path}: {source}")]
    FileSwap {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to walk package tree: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Restart request failed: {0}")]
    Restart(String),
}

/// Installs OS-level packages
pub trait PackageManager: Send + Sync {
    fn install(&self, package: &str) -> Result<(), InstallError>;
}

/// Runs the configured install command once per package
pub struct CommandPackageManager {
    command: Vec<String>,
}

impl CommandPackageManager {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl PackageManager for CommandPackageManager {
    fn install(&self, package: &str) -> Result<(), InstallError> {
        let failure = |detail: String| InstallError::SystemPackage {
            package: package.to_string(),
            detail,
        };
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| failure("no install command configured".to_string()))?;

        let output = Command::new(program)
            .args(args)
            .arg(package)
            .output()
            .map_err(|e| failure(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(failure(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub packages_installed: usize,
    pub files_written: usize,
    pub files_removed: usize,
    pub files_protected: usize,
}

pub struct Installer {
    app_dir: PathBuf,
    manifest: ProtectedManifest,
}

impl Installer {
    pub fn new(app_dir: &Path, manifest: ProtectedManifest) -> Self {
        Self {
            app_dir: app_dir.to_path_buf(),
            manifest,
        }
    }

    pub fn manifest(&self) -> &ProtectedManifest {
        &self.manifest
    }

    pub fn install(
        &self,
        staged: &Path,
        system_packages: &[String],
        packages: &dyn PackageManager,
    ) -> Result<InstallReport, InstallError> {
        let mut report = InstallReport::default();

        for package in system_packages {
            tracing::info!(package = %package, "installing system package");
            packages.install(package)?;
            report.packages_installed += 1;
        }

        let shipped = self.copy_tree(staged, &mut report)?;
        self.remove_stale(&shipped, &mut report)?;
        self.write_shipped_list(&shipped)?;

        // Marker last
        let marker = staged.join(VERSION_MARKER);
        copy_atomic(&marker, &self.app_dir.join(VERSION_MARKER))?;
        report.files_written += 1;

        Ok(report)
    }

    fn copy_tree(
        &self,
        staged: &Path,
        report: &mut InstallReport,
    ) -> Result<BTreeSet<PathBuf>, InstallError> {
        let mut shipped = BTreeSet::new();

        for entry in WalkDir::new(staged).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = match entry.path().strip_prefix(staged) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => continue,
            };
            if relative == Path::new(VERSION_MARKER) || relative == Path::new(SHIPPED_LIST) {
                continue;
            }
            if self.manifest.is_protected(&relative) {
                tracing::debug!(path = %relative.display(), "skipping protected path");
                report.files_protected += 1;
                continue;
            }
            copy_atomic(entry.path(), &self.app_dir.join(&relative))?;
            shipped.insert(relative);
            report.files_written += 1;
        }

        Ok(shipped)
    }

    /// Paths recorded by the previous install; empty before the first one
    fn previously_shipped(&self) -> Result<BTreeSet<PathBuf>, InstallError> {
        let path = self.app_dir.join(SHIPPED_LIST);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(PathBuf::from)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(source) => Err(InstallError::FileSwap { path, source }),
        }
    }

    fn remove_stale(
        &self,
        shipped: &BTreeSet<PathBuf>,
        report: &mut InstallReport,
    ) -> Result<(), InstallError> {
        let previous = self.previously_shipped()?;
        let stale = previous.difference(shipped).filter(|relative| {
            relative.is_relative()
                && !relative.components().any(|c| matches!(c, Component::ParentDir))
                && !in_unshipped_dir(relative)
                && !self.manifest.is_protected(relative)
        });

        for relative in stale {
            let path = self.app_dir.join(relative);
            match fs::remove_file(&path) {
                Ok(()) => report.files_removed += 1,
                // Already gone after an interrupted earlier attempt
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(InstallError::FileSwap { path, source }),
            }
        }
        Ok(())
    }

    fn write_shipped_list(&self, shipped: &BTreeSet<PathBuf>) -> Result<(), InstallError> {
        let path = self.app_dir.join(SHIPPED_LIST);
        let mut content = String::new();
        for relative in shipped {
            content.push_str(&relative.to_string_lossy());
            content.push('\n');
        }
        let temp = self.app_dir.join(format!(".{SHIPPED_LIST}.devfleet-new"));
        fs::write(&temp, content)
            .and_then(|()| fs::rename(&temp, &path))
            .map_err(|source| InstallError::FileSwap { path, source })
    }
}

/// Copy into a sibling temp file then rename over the target
fn copy_atomic(from: &Path, to: &Path) -> Result<(), InstallError> {
    let swap_err = |source: io::Error| InstallError::FileSwap {
        path: to.to_path_buf(),
        source,
    };
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(swap_err)?;
    }
    let file_name = to
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp = to.with_file_name(format!(".{}.devfleet-new", file_name));
    fs::copy(from, &temp).map_err(swap_err)?;
    fs::rename(&temp, to).map_err(|e| {
        let _ = fs::remove_file(&temp);
        swap_err(e)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Records install calls and fails on the named package
    #[derive(Default)]
    pub(crate) struct FakePackages {
        pub installed: Mutex<Vec<String>>,
        pub fail_on: Option<String>,
    }

    impl PackageManager for FakePackages {
        fn install(&self, package: &str) -> Result<(), InstallError> {
            if self.fail_on.as_deref() == Some(package) {
                return Err(InstallError::SystemPackage {
                    package: package.to_string(),
                    detail: "exit status: 100".to_string(),
                });
            }
            self.installed.lock().unwrap().push(package.to_string());
            Ok(())
        }
    }

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn setup() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempdir().unwrap();
        let app = dir.path().join("app");
        let staged = dir.path().join("staged");

        write(&app, "VERSION", "v1.0.0\n");
        write(&app, SHIPPED_LIST, "main.py\nold_module.py\n");
        write(&app, "main.py", "old main");
        write(&app, "old_module.py", "gone in v2");
        write(&app, ".env", "API_KEY=device-secret");
        write(&app, "credentials/google.json", "{\"secret\": true}");

        write(&staged, "VERSION", "v2.0.0\n");
        write(&staged, "main.py", "new main");
        write(&staged, "lib/helpers.py", "helpers");
        write(&staged, ".env", "API_KEY=publisher-leak");
        (dir, app, staged)
    }

    #[test]
    fn test_install_swaps_files_and_keeps_protected() {
        let (_dir, app, staged) = setup();
        let installer = Installer::new(&app, ProtectedManifest::default());
        let packages = FakePackages::default();

        let report = installer
            .install(&staged, &["ffmpeg".to_string()], &packages)
            .unwrap();

        assert_eq!(fs::read_to_string(app.join("VERSION")).unwrap(), "v2.0.0\n");
        assert_eq!(fs::read_to_string(app.join("main.py")).unwrap(), "new main");
        assert_eq!(fs::read_to_string(app.join("lib/helpers.py")).unwrap(), "helpers");
        assert!(!app.join("old_module.py").exists());

        // Protected files are neither overwritten nor removed
        assert_eq!(
            fs::read_to_string(app.join(".env")).unwrap(),
            "API_KEY=device-secret"
        );
        assert!(app.join("credentials/google.json").exists());

        assert_eq!(report.packages_installed, 1);
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.files_protected, 1);
        assert_eq!(*packages.installed.lock().unwrap(), vec!["ffmpeg".to_string()]);
        assert_eq!(
            fs::read_to_string(app.join(SHIPPED_LIST)).unwrap(),
            "lib/helpers.py\nmain.py\n"
        );
    }

    #[test]
    fn test_device_local_trees_survive_install() {
        let (dir, app, staged) = setup();
        write(&app, ".git/HEAD", "ref: refs/heads/main");
        write(&app, "venv/bin/python", "#!/bin/sh");
        write(&app, "node_modules/x/index.js", "module.exports = 1");
        write(&app, "__pycache__/main.cpython-311.pyc", "bytecode");
        // A tampered list must not reach into unshipped directories
        write(
            &app,
            SHIPPED_LIST,
            "main.py\nold_module.py\n.git/HEAD\nnode_modules/x/index.js\n../outside.txt\n",
        );
        write(dir.path(), "outside.txt", "not ours");

        let installer = Installer::new(&app, ProtectedManifest::default());
        installer
            .install(&staged, &[], &FakePackages::default())
            .unwrap();

        assert!(app.join(".git/HEAD").exists());
        assert!(app.join("venv/bin/python").exists());
        assert!(app.join("node_modules/x/index.js").exists());
        assert!(app.join("__pycache__/main.cpython-311.pyc").exists());
        assert!(dir.path().join("outside.txt").exists());
        assert!(!app.join("old_module.py").exists());
    }

    #[test]
    fn test_first_install_removes_nothing() {
        let (_dir, app, staged) = setup();
        fs::remove_file(app.join(SHIPPED_LIST)).unwrap();

        let installer = Installer::new(&app, ProtectedManifest::default());
        let report = installer
            .install(&staged, &[], &FakePackages::default())
            .unwrap();

        assert_eq!(report.files_removed, 0);
        assert!(app.join("old_module.py").exists());
        assert_eq!(fs::read_to_string(app.join("main.py")).unwrap(), "new main");
    }

    #[test]
    fn test_failed_system_package_leaves_app_untouched() {
        let (_dir, app, staged) = setup();
        let installer = Installer::new(&app, ProtectedManifest::default());
        let packages = FakePackages {
            fail_on: Some("libfoo".to_string()),
            ..Default::default()
        };

        let err = installer
            .install(
                &staged,
                &["ffmpeg".to_string(), "libfoo".to_string()],
                &packages,
            )
            .unwrap_err();
        assert!(matches!(err, InstallError::SystemPackage { .. }));

        assert_eq!(fs::read_to_string(app.join("VERSION")).unwrap(), "v1.0.0\n");
        assert_eq!(fs::read_to_string(app.join("main.py")).unwrap(), "old main");
        assert!(app.join("old_module.py").exists());
        assert!(!app.join("lib").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_package_manager_reports_failure() {
        let failing = CommandPackageManager::new(vec!["false".to_string()]);
        assert!(matches!(
            failing.install("ffmpeg"),
            Err(InstallError::SystemPackage { .. })
        ));

        let ok = CommandPackageManager::new(vec!["true".to_string()]);
        assert!(ok.install("ffmpeg").is_ok());
    }
}
