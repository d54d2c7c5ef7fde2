//! Server-side registries
//!
//! - `devices` - Device identity, status and last known version
//! - `updates` - Immutable published updates, keyed by version
//! - `blobs` - Filesystem object store holding package archives

pub mod blobs;
pub mod devices;
pub mod error;
pub mod updates;

pub use blobs::BlobStore;
pub use devices::DeviceRegistry;
pub use error::RegistryError;
pub use updates::{NewUpdate, UpdateRegistry};
