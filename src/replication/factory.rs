//! Builds the clients a replication job talks through
//!
//! The source is the local registry: requests carry the internal secret
//! (as a cookie to the token service, or a minted token when a minting
//! function is configured). The target is a remote instance reached with
//! basic credentials, exchanged for bearer tokens when it asks for them.

use crate::common::utils::Endpoint;
use crate::error::{Result, ResultExt};
use crate::registry::auth::generator::DEFAULT_SERVICE;
use crate::registry::auth::{
    Authorizer, AuthorizerStore, BasicAuthCredential, BasicAuthorizer, BearerAuthorizer,
    CookieCredential, MintFn, RawTokenGenerator, StandardTokenGenerator, TokenGenerator,
};
use crate::registry::{Modifier, RegistryClient, RepositoryClient, Transport, Transports, UserAgentModifier};
use crate::replication::admin::AdminClient;
use crate::replication::{SourceEndpoint, TargetEndpoint, USER_AGENT};
use std::sync::Arc;

/// Identity used when minting tokens for the local registry
pub const JOBSERVICE_USERNAME: &str = "harbor-jobservice";

#[derive(Clone)]
pub struct ClientFactory {
    transports: Transports,
    token_service_url: Option<String>,
    mint: Option<MintFn>,
}

impl ClientFactory {
    pub fn new(transports: Transports) -> Self {
        Self {
            transports,
            token_service_url: None,
            mint: None,
        }
    }

    /// Use a fixed token service for the local registry instead of the
    /// realm it advertises.
    pub fn with_token_service(mut self, url: impl Into<String>) -> Self {
        self.token_service_url = Some(url.into());
        self
    }

    /// Mint local-registry tokens in-process.
    pub fn with_mint(mut self, mint: MintFn) -> Self {
        self.mint = Some(mint);
        self
    }

    fn base_modifiers() -> Vec<Arc<dyn Modifier>> {
        vec![Arc::new(UserAgentModifier::new(USER_AGENT))]
    }

    async fn registry_transport(
        &self,
        endpoint: &str,
        insecure: bool,
        authorizers: Vec<Arc<dyn Authorizer>>,
    ) -> Result<Transport> {
        let endpoint = Endpoint::parse(endpoint)?;
        let client = self.transports.get(Some(insecure));
        let store = AuthorizerStore::new(&endpoint, &client, authorizers).await?;

        let mut modifiers = Self::base_modifiers();
        modifiers.push(Arc::new(store));
        Ok(Transport::new(client, modifiers))
    }

    fn source_authorizers(&self, source: &SourceEndpoint) -> Vec<Arc<dyn Authorizer>> {
        let generator: Arc<dyn TokenGenerator> = match &self.mint {
            Some(mint) => Arc::new(RawTokenGenerator::new(
                DEFAULT_SERVICE,
                JOBSERVICE_USERNAME,
                mint.clone(),
            )),
            None => {
                let credential: Arc<dyn Modifier> = Arc::new(CookieCredential::secret(&source.secret));
                let generator = StandardTokenGenerator::new(
                    self.transports.get(Some(source.insecure)),
                    Some(credential),
                );
                match &self.token_service_url {
                    Some(url) => Arc::new(generator.with_realm(url.as_str())),
                    None => Arc::new(generator),
                }
            }
        };
        vec![Arc::new(BearerAuthorizer::new(generator))]
    }

    fn target_authorizers(&self, target: &TargetEndpoint) -> Vec<Arc<dyn Authorizer>> {
        let credential: Arc<dyn Modifier> =
            Arc::new(BasicAuthCredential::new(&target.username, &target.password));
        let generator = StandardTokenGenerator::new(
            self.transports.get(Some(target.insecure)),
            Some(credential),
        );
        vec![
            Arc::new(BearerAuthorizer::new(Arc::new(generator))),
            Arc::new(BasicAuthorizer::new(&target.username, &target.password)),
        ]
    }

    pub async fn source_registry(&self, source: &SourceEndpoint) -> Result<RegistryClient> {
        let transport = self
            .registry_transport(&source.registry_url, source.insecure, self.source_authorizers(source))
            .await
            .context("connecting to source registry")?;
        RegistryClient::new(&source.registry_url, transport)
    }

    pub async fn source_repository(&self, source: &SourceEndpoint, repository: &str) -> Result<RepositoryClient> {
        let transport = self
            .registry_transport(&source.registry_url, source.insecure, self.source_authorizers(source))
            .await
            .context("connecting to source registry")?;
        RepositoryClient::new(repository.trim(), &source.registry_url, transport)
    }

    pub async fn target_repository(&self, target: &TargetEndpoint, repository: &str) -> Result<RepositoryClient> {
        let transport = self
            .registry_transport(&target.url, target.insecure, self.target_authorizers(target))
            .await
            .context("connecting to target registry")?;
        RepositoryClient::new(repository.trim(), &target.url, transport)
    }

    /// Admin API of the local instance, when one is configured.
    pub fn source_admin(&self, source: &SourceEndpoint) -> Result<Option<AdminClient>> {
        let Some(admin_url) = &source.admin_url else {
            return Ok(None);
        };
        let mut modifiers = Self::base_modifiers();
        modifiers.push(Arc::new(CookieCredential::secret(&source.secret)));
        let transport = Transport::new(self.transports.get(Some(source.insecure)), modifiers);
        AdminClient::new(admin_url, transport).map(Some)
    }

    pub fn target_admin(&self, target: &TargetEndpoint) -> Result<AdminClient> {
        let mut modifiers = Self::base_modifiers();
        modifiers.push(Arc::new(BasicAuthCredential::new(&target.username, &target.password)));
        let transport = Transport::new(self.transports.get(Some(target.insecure)), modifiers);
        AdminClient::new(&target.url, transport)
    }
}
