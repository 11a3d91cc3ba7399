//! Registry Replicator Library
//!
//! Replicates repositories between container registries: registry and
//! admin API clients with challenge-driven authorization, resumable
//! transfer and deletion jobs, a bounded job runner, and the controller
//! and HTTP surface that drive them.

pub mod cli;
pub mod common;
pub mod concurrency;
pub mod config;
pub mod controller;
pub mod error;
pub mod image;
pub mod logging;
pub mod registry;
pub mod replication;
pub mod scheduler;

pub use config::CoreConfig;
pub use controller::Controller;
pub use error::{ReplicationError, Result};
