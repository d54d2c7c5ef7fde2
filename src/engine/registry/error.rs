//! Registry Error Types

use thiserror::Error;

use crate::engine::database::DatabaseError;
use crate::engine::error::ErrorKind;
use crate::engine::version::VersionParseError;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid device UUID: {0}")]
    InvalidUuid(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error(transparent)]
    InvalidVersion(#[from] VersionParseError),

    #[error("Invalid status report: {0}")]
    InvalidStatus(String),

    #[error("Invalid system package list: {0}")]
    InvalidPackageList(String),

    #[error("Package body is empty")]
    EmptyPackage,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Device is disabled: {0}")]
    Forbidden(String),

    #[error("Version already published: {0}")]
    DuplicateVersion(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Blob store error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt stored record: {0}")]
    Corrupt(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUuid(_)
            | Self::InvalidTimezone(_)
            | Self::InvalidVersion(_)
            | Self::InvalidStatus(_)
            | Self::InvalidPackageList(_)
            | Self::EmptyPackage => ErrorKind::Validation,
            Self::DuplicateVersion(_) => ErrorKind::Conflict,
            Self::UnknownDevice(_) | Self::Forbidden(_) => ErrorKind::Authorization,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Database(_) | Self::Sqlite(_) | Self::Io(_) | Self::Corrupt(_) => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
