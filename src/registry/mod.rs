//! Registry module for Docker/OCI registry interactions
//!
//! HTTP plumbing ([`Transports`], [`Transport`]), the request-modifier chain,
//! authentication, and the registry- and repository-level clients built on
//! top of them.

pub mod auth;
pub mod client;
pub mod modifier;
pub mod repository;
pub mod transport;

pub use client::RegistryClient;
pub use modifier::{Modifier, UserAgentModifier};
pub use repository::{BlobStream, PulledManifest, RepositoryClient};
pub use transport::{Transport, Transports};
