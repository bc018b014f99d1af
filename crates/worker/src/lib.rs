//! `productsnap-worker`: process that runs the image-job worker pool.

pub mod config;

pub use config::{ConfigError, ProviderKind, ServiceConfig};
