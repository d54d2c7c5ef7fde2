//! Release packaging
//!
//! Snapshots an application source tree into a gzip tarball with a pinned
//! `VERSION` marker and a `system-packages.txt` declaration at its root.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use super::PublishError;
use crate::engine::registry::updates::package_checksum;
use crate::engine::updater::manifest::{ProtectedManifest, UNSHIPPED_DIRS};
use crate::engine::updater::version_manager::{SHIPPED_LIST, SYSTEM_PACKAGES_FILE, VERSION_MARKER};
use crate::engine::version::Version;

pub const DEPENDENCY_MANIFEST: &str = "requirements.txt";

#[derive(Debug)]
pub struct BuiltPackage {
    pub bytes: Vec<u8>,
    pub checksum: String,
    pub file_count: usize,
    pub has_dependency_manifest: bool,
}

pub struct PackageBuilder {
    source_dir: PathBuf,
    manifest: ProtectedManifest,
    dependency_manifest: Option<PathBuf>,
}

impl PackageBuilder {
    pub fn new(source_dir: &Path, manifest: ProtectedManifest) -> Self {
        Self {
            source_dir: source_dir.to_path_buf(),
            manifest,
            dependency_manifest: None,
        }
    }

    /// Ship this file as the root `requirements.txt` instead of the tree's own
    pub fn with_dependency_manifest(mut self, path: &Path) -> Self {
        self.dependency_manifest = Some(path.to_path_buf());
        self
    }

    pub fn build(
        &self,
        version: &Version,
        system_packages: &[String],
    ) -> Result<BuiltPackage, PublishError> {
        if !self.source_dir.is_dir() {
            return Err(PublishError::SourceMissing(self.source_dir.clone()));
        }

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        builder.follow_symlinks(false);
        let mut file_count = 0;
        let mut has_dependency_manifest = false;

        let walker = WalkDir::new(&self.source_dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.is_skipped(e));

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = match entry.path().strip_prefix(&self.source_dir) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            if relative == Path::new(DEPENDENCY_MANIFEST) {
                if self.dependency_manifest.is_some() {
                    continue;
                }
                has_dependency_manifest = true;
            }
            builder.append_path_with_name(entry.path(), relative)?;
            file_count += 1;
        }

        if let Some(path) = &self.dependency_manifest {
            builder.append_path_with_name(path, DEPENDENCY_MANIFEST)?;
            file_count += 1;
            has_dependency_manifest = true;
        }

        append_text(&mut builder, VERSION_MARKER, &format!("{}\n", version))?;
        let mut declared = system_packages.join("\n");
        if !declared.is_empty() {
            declared.push('\n');
        }
        append_text(&mut builder, SYSTEM_PACKAGES_FILE, &declared)?;

        let bytes = builder.into_inner()?.finish()?;
        let checksum = package_checksum(&bytes);
        tracing::info!(
            version = %version,
            files = file_count,
            size = bytes.len(),
            checksum = %checksum,
            "package built"
        );

        Ok(BuiltPackage {
            bytes,
            checksum,
            file_count,
            has_dependency_manifest,
        })
    }

    fn is_skipped(&self, entry: &DirEntry) -> bool {
        let relative = match entry.path().strip_prefix(&self.source_dir) {
            Ok(relative) => relative,
            Err(_) => return true,
        };
        if entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| UNSHIPPED_DIRS.contains(&name))
        {
            return true;
        }
        // Generated at the root of every package, or written by the installer
        if [VERSION_MARKER, SYSTEM_PACKAGES_FILE, SHIPPED_LIST]
            .iter()
            .any(|name| relative == Path::new(name))
        {
            return true;
        }
        self.manifest.is_protected(relative)
    }
}

fn append_text<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    contents: &str,
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, name, contents.as_bytes())
}
