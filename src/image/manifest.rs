//! Manifest media types and a generic manifest view
//!
//! Replication never rewrites manifests: the payload bytes pulled from the
//! source are pushed to the target verbatim. All the state machine needs is
//! the media type and the list of blobs the manifest references.

use crate::error::{ReplicationError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const MEDIA_TYPE_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_SIGNED_MANIFEST_V1: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_SCHEMA1_LAYER: &str =
    "application/vnd.docker.container.image.rootfs.diff+x-gtar";

/// Media types sent in `Accept` when pulling or probing manifests
pub const ACCEPTED_MANIFEST_TYPES: [&str; 2] = [MEDIA_TYPE_MANIFEST_V1, MEDIA_TYPE_MANIFEST_V2];

/// A blob reference inside a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub size: i64,
    pub digest: String,
}

#[derive(Deserialize)]
struct Schema1Body {
    #[serde(rename = "fsLayers", default)]
    fs_layers: Vec<FsLayer>,
}

#[derive(Deserialize)]
struct FsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Deserialize)]
struct Schema2Body {
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Versioned {
    #[serde(default)]
    schema_version: i32,
    #[serde(default)]
    media_type: Option<String>,
}

/// Map the `Content-Type` a registry answered with onto a manifest media type.
///
/// Old registries serve schema1 manifests as plain `application/json`.
pub fn normalize_media_type(content_type: &str) -> String {
    let bare = content_type.split(';').next().unwrap_or_default().trim();
    if bare.contains("application/json") {
        MEDIA_TYPE_MANIFEST_V1.to_string()
    } else {
        bare.to_string()
    }
}

/// A pulled manifest: media type, the exact payload bytes and its references
#[derive(Debug, Clone)]
pub struct Manifest {
    media_type: String,
    payload: Bytes,
    references: Vec<Descriptor>,
}

impl Manifest {
    pub fn unmarshal(media_type: &str, payload: Bytes) -> Result<Self> {
        let media_type = if media_type.is_empty() {
            Self::sniff_media_type(&payload)?
        } else {
            normalize_media_type(media_type)
        };

        let references = match media_type.as_str() {
            MEDIA_TYPE_MANIFEST_V1 | MEDIA_TYPE_SIGNED_MANIFEST_V1 => {
                let body: Schema1Body = serde_json::from_slice(&payload).map_err(|e| {
                    ReplicationError::Protocol(format!("invalid schema1 manifest: {}", e))
                })?;
                body.fs_layers
                    .into_iter()
                    .map(|layer| Descriptor {
                        media_type: MEDIA_TYPE_SCHEMA1_LAYER.to_string(),
                        size: 0,
                        digest: layer.blob_sum,
                    })
                    .collect()
            }
            MEDIA_TYPE_MANIFEST_V2 | MEDIA_TYPE_OCI_MANIFEST => {
                let body: Schema2Body = serde_json::from_slice(&payload).map_err(|e| {
                    ReplicationError::Protocol(format!("invalid image manifest: {}", e))
                })?;
                std::iter::once(body.config).chain(body.layers).collect()
            }
            other => {
                return Err(ReplicationError::Protocol(format!(
                    "unsupported manifest media type: {}",
                    other
                )));
            }
        };

        Ok(Self {
            media_type,
            payload,
            references,
        })
    }

    fn sniff_media_type(payload: &[u8]) -> Result<String> {
        let versioned: Versioned = serde_json::from_slice(payload)
            .map_err(|e| ReplicationError::Protocol(format!("invalid manifest: {}", e)))?;
        match (versioned.schema_version, versioned.media_type) {
            (1, _) => Ok(MEDIA_TYPE_MANIFEST_V1.to_string()),
            (_, Some(media_type)) => Ok(media_type),
            (2, None) => Ok(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            (version, None) => Err(ReplicationError::Protocol(format!(
                "unknown manifest schema version {}",
                version
            ))),
        }
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Blobs referenced by the manifest, config first for schema2
    pub fn references(&self) -> &[Descriptor] {
        &self.references
    }
}
