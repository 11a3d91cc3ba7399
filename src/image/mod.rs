//! Image metadata handling
//!
//! Types for the pieces of an image a replication job has to understand:
//! manifests (schema1, schema2 and OCI) and the blobs they reference, digests,
//! and the naming rules for repositories and tags.

pub mod digest;
pub mod manifest;
pub mod reference;

pub use digest::DigestUtils;
pub use manifest::{Descriptor, Manifest, normalize_media_type};
pub use reference::{validate_repository, validate_tag};
