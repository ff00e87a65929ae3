//! C1 — Docker Engine Migrator.
//!
//! A one-shot pipeline that copies images, volumes, networks and
//! containers from a foreign Docker engine into the product's own
//! engine, with dependency ordering, freeze/thaw of running containers,
//! and resumption-safe error handling.

pub mod daemon_config;
pub mod dependency_runner;
pub mod docker;
pub mod entities;
pub mod error;
pub mod host_environment;
pub mod id_translation;
pub mod manifest;
pub mod orchestrator;
pub mod pause_refcount;
pub mod progress;
pub mod sync_channel;
pub mod worker_pool;

pub use error::MigrateError;
pub use orchestrator::{enumerate_source, filter_manifest, migrate_all, FilteredManifest, MigrateParams, MigrateReport};
