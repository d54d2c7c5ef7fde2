// devfleet Engine - Core module structure
pub mod api;
pub mod audit;
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod keystore;
pub mod locks;
pub mod logging;
pub mod models;
pub mod publisher;
pub mod registry;
pub mod updater;
pub mod version;

pub use config::Config;
pub use database::Database;
pub use error::ErrorKind;
pub use version::Version;
