//! Registry authentication
//!
//! Credentials are plain [`Modifier`]s. Authorizers additionally declare the
//! challenge scheme they answer so an [`AuthorizerStore`] can pick them based
//! on what the registry asked for.

pub mod challenge;
pub mod credential;
pub mod generator;
pub mod scope;
pub mod store;
pub mod token_manager;

use crate::error::Result;
use crate::registry::modifier::Modifier;
use async_trait::async_trait;
use reqwest::Request;
use std::collections::HashMap;

pub use challenge::{Challenge, parse_challenges};
pub use credential::{
    ApiKeyCredential, BasicAuthCredential, CookieCredential, SecretHeaderCredential,
};
pub use generator::{MintFn, RawTokenGenerator, StandardTokenGenerator, TokenGenerator};
pub use scope::{Scope, parse_scopes, parse_scopes_under};
pub use store::{AuthorizerStore, BasicAuthorizer};
pub use token_manager::{BearerAuthorizer, Token, TokenCache};

/// A credential is any modifier that authenticates a request.
pub use crate::registry::modifier::Modifier as Credential;

#[async_trait]
pub trait Authorizer: Modifier {
    /// Lowercase challenge scheme this authorizer answers
    fn scheme(&self) -> &str;

    async fn authorize(&self, request: &mut Request, parameters: &HashMap<String, String>) -> Result<()>;
}
