//! Repository-scoped registry operations
//!
//! Tags, manifests and blobs of a single repository. Manifest payloads are
//! carried as raw bytes so they can be pushed elsewhere unchanged; blob
//! bodies are streamed straight from the pull response into the push request.

use crate::common::utils::Endpoint;
use crate::error::handlers::HttpErrorHandler;
use crate::error::{ReplicationError, Result, ResultExt};
use crate::image::digest::DigestUtils;
use crate::image::manifest::ACCEPTED_MANIFEST_TYPES;
use crate::registry::client::{next_page_url, resolve_location};
use crate::registry::transport::Transport;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue, LINK, LOCATION};
use reqwest::{Body, Method, Request, Response, StatusCode};
use serde::Deserialize;

pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
pub const DOCKER_UPLOAD_UUID: &str = "Docker-Upload-UUID";

pub fn build_tag_list_url(endpoint: &Endpoint, repository: &str) -> String {
    endpoint.join(&format!("/v2/{}/tags/list", repository))
}

pub fn build_manifest_url(endpoint: &Endpoint, repository: &str, reference: &str) -> String {
    endpoint.join(&format!("/v2/{}/manifests/{}", repository, reference))
}

pub fn build_blob_url(endpoint: &Endpoint, repository: &str, digest: &str) -> String {
    endpoint.join(&format!("/v2/{}/blobs/{}", repository, digest))
}

pub fn build_mount_blob_url(endpoint: &Endpoint, repository: &str, digest: &str, from: &str) -> String {
    endpoint.join(&format!(
        "/v2/{}/blobs/uploads/?mount={}&from={}",
        repository, digest, from
    ))
}

pub fn build_initiate_blob_upload_url(endpoint: &Endpoint, repository: &str) -> String {
    endpoint.join(&format!("/v2/{}/blobs/uploads/", repository))
}

/// Final `PUT` target of a monolithic upload: the upload location with
/// `digest=` appended to whatever query it already carries.
pub fn build_monolithic_blob_upload_url(endpoint: &Endpoint, location: &str, digest: &str) -> Result<String> {
    let base = resolve_location(endpoint, location)?;
    let separator = if base.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}digest={}", base, separator, digest))
}

#[derive(Debug, Deserialize)]
struct TagPage {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// A manifest as served by the registry
#[derive(Debug, Clone)]
pub struct PulledManifest {
    pub digest: String,
    pub media_type: String,
    pub payload: Bytes,
}

/// An open blob download; the body is not read until it is consumed.
#[derive(Debug)]
pub struct BlobStream {
    size: u64,
    response: Response,
}

impl BlobStream {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Turn the download into a streaming request body.
    pub fn into_body(self) -> Body {
        Body::wrap_stream(self.response.bytes_stream())
    }

    /// Buffer the whole blob.
    pub async fn bytes(self) -> Result<Bytes> {
        Ok(self.response.bytes().await?)
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryClient {
    name: String,
    endpoint: Endpoint,
    transport: Transport,
}

impl RepositoryClient {
    pub fn new(name: impl Into<String>, endpoint: &str, transport: Transport) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            endpoint: Endpoint::parse(endpoint)?,
            transport,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn request(&self, method: Method, url: &str) -> Result<Request> {
        Ok(self.transport.client().request(method, url).build()?)
    }

    async fn send(&self, request: Request) -> Result<Response> {
        self.transport.round_trip(request).await
    }

    fn header_string(response: &Response, name: &str) -> Option<String> {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn digest_header(response: &Response) -> Option<String> {
        Self::header_string(response, DOCKER_CONTENT_DIGEST)
    }

    fn accept_manifests(request: &mut Request, accept: &[&str]) {
        for media_type in accept {
            if let Ok(value) = HeaderValue::from_str(media_type) {
                request.headers_mut().append(ACCEPT, value);
            }
        }
    }

    /// All tags, sorted. A 404 from the registry ends the listing.
    pub async fn list_tag(&self) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut next = Some(build_tag_list_url(&self.endpoint, &self.name));

        while let Some(url) = next.take() {
            let request = self.request(Method::GET, &url)?;
            let response = self
                .send(request)
                .await
                .with_context(|| format!("listing tags of {}", self.name))?;
            match response.status() {
                StatusCode::OK => {}
                StatusCode::NOT_FOUND => break,
                _ => return Err(HttpErrorHandler::from_response(response).await),
            }

            next = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(|link| next_page_url(link, &self.endpoint));

            let page: TagPage = response.json().await?;
            tags.extend(page.tags.unwrap_or_default());
        }

        tags.sort();
        Ok(tags)
    }

    /// `HEAD` the manifest. Returns the digest and whether it exists; a 404 is
    /// not an error.
    pub async fn manifest_exist(&self, reference: &str) -> Result<(String, bool)> {
        let mut request = self.request(
            Method::HEAD,
            &build_manifest_url(&self.endpoint, &self.name, reference),
        )?;
        Self::accept_manifests(&mut request, &ACCEPTED_MANIFEST_TYPES);

        let response = self
            .send(request)
            .await
            .with_context(|| format!("checking manifest {}:{}", self.name, reference))?;
        match response.status() {
            StatusCode::OK => Ok((Self::digest_header(&response).unwrap_or_default(), true)),
            StatusCode::NOT_FOUND => Ok((String::new(), false)),
            _ => Err(HttpErrorHandler::from_response(response).await),
        }
    }

    pub async fn pull_manifest(&self, reference: &str, accept: &[&str]) -> Result<PulledManifest> {
        let mut request = self.request(
            Method::GET,
            &build_manifest_url(&self.endpoint, &self.name, reference),
        )?;
        Self::accept_manifests(&mut request, accept);

        let response = self
            .send(request)
            .await
            .with_context(|| format!("pulling manifest {}:{}", self.name, reference))?;
        if response.status() != StatusCode::OK {
            return Err(HttpErrorHandler::from_response(response).await);
        }

        let header_digest = Self::digest_header(&response);
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let payload = response.bytes().await?;
        let digest = header_digest.unwrap_or_else(|| DigestUtils::compute_docker_digest(&payload));

        Ok(PulledManifest {
            digest,
            media_type,
            payload,
        })
    }

    /// Upload a manifest under `reference`; returns the digest the registry
    /// reports.
    pub async fn push_manifest(&self, reference: &str, media_type: &str, payload: Bytes) -> Result<String> {
        let fallback_digest = DigestUtils::compute_docker_digest(&payload);
        let request = self
            .transport
            .client()
            .put(build_manifest_url(&self.endpoint, &self.name, reference))
            .header(CONTENT_TYPE, media_type)
            .body(payload)
            .build()?;

        let response = self
            .send(request)
            .await
            .with_context(|| format!("pushing manifest {}:{}", self.name, reference))?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => {
                Ok(Self::digest_header(&response).unwrap_or(fallback_digest))
            }
            _ => Err(HttpErrorHandler::from_response(response).await),
        }
    }

    /// Delete by digest; registries refuse manifest deletion by tag.
    pub async fn delete_manifest(&self, digest: &str) -> Result<()> {
        DigestUtils::validate(digest)?;
        let request = self.request(
            Method::DELETE,
            &build_manifest_url(&self.endpoint, &self.name, digest),
        )?;
        let response = self
            .send(request)
            .await
            .with_context(|| format!("deleting manifest {}@{}", self.name, digest))?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(()),
            _ => Err(HttpErrorHandler::from_response(response).await),
        }
    }

    /// Resolve the tag to its digest, then delete the manifest.
    pub async fn delete_tag(&self, tag: &str) -> Result<()> {
        let (digest, exists) = self.manifest_exist(tag).await?;
        if !exists {
            return Err(ReplicationError::http(
                404,
                format!("tag {} of {} not found", tag, self.name),
            ));
        }
        self.delete_manifest(&digest).await
    }

    pub async fn blob_exist(&self, digest: &str) -> Result<bool> {
        let request = self.request(
            Method::HEAD,
            &build_blob_url(&self.endpoint, &self.name, digest),
        )?;
        let response = self
            .send(request)
            .await
            .with_context(|| format!("checking blob {}", digest))?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(HttpErrorHandler::from_response(response).await),
        }
    }

    /// Open a blob download; the size comes from `Content-Length`.
    pub async fn pull_blob(&self, digest: &str) -> Result<BlobStream> {
        let request = self.request(
            Method::GET,
            &build_blob_url(&self.endpoint, &self.name, digest),
        )?;
        let response = self
            .send(request)
            .await
            .with_context(|| format!("pulling blob {}", digest))?;
        if response.status() != StatusCode::OK {
            return Err(HttpErrorHandler::from_response(response).await);
        }

        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                ReplicationError::Protocol(format!(
                    "missing or invalid Content-Length for blob {}",
                    digest
                ))
            })?;

        Ok(BlobStream { size, response })
    }

    /// Monolithic upload: initiate, then a single `PUT` with the whole body.
    pub async fn push_blob(&self, digest: &str, size: u64, body: Body) -> Result<()> {
        let (location, uuid) = self.initiate_blob_upload().await?;
        tracing::debug!(repository = %self.name, digest = %digest, upload = %uuid, "upload initiated");
        self.monolithic_blob_upload(&location, digest, size, body)
            .await
    }

    /// Try a cross-repository mount. `Ok(false)` means the registry declined
    /// and opened a regular upload instead.
    pub async fn mount_blob(&self, digest: &str, from: &str) -> Result<bool> {
        let request = self.request(
            Method::POST,
            &build_mount_blob_url(&self.endpoint, &self.name, digest, from),
        )?;
        let response = self
            .send(request)
            .await
            .with_context(|| format!("mounting blob {} from {}", digest, from))?;
        match response.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::ACCEPTED => Ok(false),
            _ => Err(HttpErrorHandler::from_response(response).await),
        }
    }

    pub async fn delete_blob(&self, digest: &str) -> Result<()> {
        DigestUtils::validate(digest)?;
        let request = self.request(
            Method::DELETE,
            &build_blob_url(&self.endpoint, &self.name, digest),
        )?;
        let response = self
            .send(request)
            .await
            .with_context(|| format!("deleting blob {}", digest))?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(()),
            _ => Err(HttpErrorHandler::from_response(response).await),
        }
    }

    async fn initiate_blob_upload(&self) -> Result<(String, String)> {
        let mut request = self.request(
            Method::POST,
            &build_initiate_blob_upload_url(&self.endpoint, &self.name),
        )?;
        request
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(0u64));
        let response = self
            .send(request)
            .await
            .with_context(|| format!("initiating upload to {}", self.name))?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(HttpErrorHandler::from_response(response).await);
        }

        let location = Self::header_string(&response, LOCATION.as_str()).ok_or_else(|| {
            ReplicationError::Protocol("upload initiation without Location".to_string())
        })?;
        let uuid = Self::header_string(&response, DOCKER_UPLOAD_UUID).unwrap_or_default();
        Ok((location, uuid))
    }

    async fn monolithic_blob_upload(&self, location: &str, digest: &str, size: u64, body: Body) -> Result<()> {
        let url = build_monolithic_blob_upload_url(&self.endpoint, location, digest)?;
        let request = self
            .transport
            .client()
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(body)
            .build()?;
        let response = self
            .send(request)
            .await
            .with_context(|| format!("uploading blob {}", digest))?;
        if response.status() != StatusCode::CREATED {
            return Err(HttpErrorHandler::from_response(response).await);
        }
        Ok(())
    }
}
