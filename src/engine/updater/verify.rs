//! Package verification against the published record

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("cannot read package: {0}")]
    Read(#[from] io::Error),
    #[error("package is {actual} bytes, record says {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Lowercase hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> Result<String, VerifyError> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Size first, so a truncated transfer is reported without hashing it
pub fn verify_package(path: &Path, expected_checksum: &str, expected_size: u64) -> Result<(), VerifyError> {
    let actual = path.metadata()?.len();
    if actual != expected_size {
        return Err(VerifyError::SizeMismatch {
            expected: expected_size,
            actual,
        });
    }

    let digest = sha256_file(path)?;
    if digest.eq_ignore_ascii_case(expected_checksum) {
        Ok(())
    } else {
        Err(VerifyError::ChecksumMismatch {
            expected: expected_checksum.to_string(),
            actual: digest,
        })
    }
}
