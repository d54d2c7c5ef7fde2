//! devfleet - Update coordination for fleets of headless devices
//!
//! An update server (device and update registries behind a REST API), a
//! publisher that packages and uploads releases, and a device agent that
//! keeps one application tree on the latest published version.

pub mod engine;
