//! Update Publisher
//!
//! Packages a release from a source tree, uploads it to the update server
//! and checks the server stored exactly the bytes that were built.

pub mod client;
pub mod package;

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::error::ErrorKind;
use crate::engine::models::{UpdatePolicy, UpdateRecord};
use crate::engine::registry::updates::check_system_packages;
use crate::engine::registry::RegistryError;
use crate::engine::updater::manifest::{ManifestError, ProtectedManifest};
use crate::engine::version::{Version, VersionParseError};

pub use client::{OperatorClient, UploadRequest};
pub use package::{BuiltPackage, PackageBuilder};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Source directory not found: {0}")]
    SourceMissing(PathBuf),

    #[error(transparent)]
    InvalidVersion(#[from] VersionParseError),

    #[error("Invalid system package list: {0}")]
    InvalidPackageList(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to walk source tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Operator key rejected")]
    Unauthorized,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error {status} {code}: {message}")]
    Server {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Checksum mismatch: built {local}, server stored {remote}")]
    ChecksumMismatch { local: String, remote: String },
}

impl PublishError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceMissing(_) | Self::InvalidVersion(_) | Self::InvalidPackageList(_) => {
                ErrorKind::Validation
            }
            Self::Manifest(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unauthorized => ErrorKind::Authorization,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Http(_) | Self::ChecksumMismatch { .. } => ErrorKind::Transfer,
            Self::Server { status: 400, .. } => ErrorKind::Validation,
            Self::Io(_) | Self::Walk(_) | Self::Json(_) | Self::Server { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub version: String,
    pub description: String,
    pub policy: UpdatePolicy,
    pub system_packages: Vec<String>,
    pub requires_system_packages: Option<bool>,
    /// Replaces the tree's own `requirements.txt`
    pub dependency_manifest: Option<PathBuf>,
    /// Overrides the built-in protected-path manifest
    pub protected_manifest: Option<PathBuf>,
}

#[derive(Debug)]
pub struct PublishReport {
    pub record: UpdateRecord,
    pub file_count: usize,
    pub has_dependency_manifest: bool,
}

pub struct Publisher {
    client: OperatorClient,
}

impl Publisher {
    pub fn new(client: OperatorClient) -> Self {
        Self { client }
    }

    /// Validate, package and build without contacting the server
    pub fn prepare(
        source_dir: &Path,
        options: &PublishOptions,
    ) -> Result<(Version, bool, BuiltPackage), PublishError> {
        let version = Version::parse(&options.version)?;
        let requires =
            check_system_packages(options.requires_system_packages, &options.system_packages)
                .map_err(|e| match e {
                    RegistryError::InvalidPackageList(message) => {
                        PublishError::InvalidPackageList(message)
                    }
                    other => PublishError::InvalidPackageList(other.to_string()),
                })?;

        let manifest = match &options.protected_manifest {
            Some(path) => ProtectedManifest::load(path)?,
            None => ProtectedManifest::default(),
        };
        let mut builder = PackageBuilder::new(source_dir, manifest);
        if let Some(path) = &options.dependency_manifest {
            builder = builder.with_dependency_manifest(path);
        }
        let built = builder.build(&version, &options.system_packages)?;
        Ok((version, requires, built))
    }

    pub async fn publish(
        &self,
        source_dir: &Path,
        options: &PublishOptions,
    ) -> Result<PublishReport, PublishError> {
        let (version, requires, built) = Self::prepare(source_dir, options)?;

        let request = UploadRequest {
            version: version.to_string(),
            description: options.description.clone(),
            requires_system_packages: requires,
            system_packages: options.system_packages.clone(),
            policy: options.policy,
        };
        let local = built.checksum.clone();
        let record = self.client.upload(&request, built.bytes).await?;

        if !record.package_checksum.eq_ignore_ascii_case(&local) {
            tracing::error!(
                version = %version,
                local = %local,
                remote = %record.package_checksum,
                "server checksum differs from built package"
            );
            return Err(PublishError::ChecksumMismatch {
                local,
                remote: record.package_checksum,
            });
        }

        tracing::info!(version = %version, checksum = %local, "release published");
        Ok(PublishReport {
            record,
            file_count: built.file_count,
            has_dependency_manifest: built.has_dependency_manifest,
        })
    }
}
