//! Credential acquisition for the streaming endpoint.
//!
//! The OAuth2 token request is built here and posted through a
//! [`TokenExchange`], which wraps whatever HTTP client the application uses.

use crate::codec::{JsonCodec, SerdeJsonCodec};
use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Streaming API version of the endpoint path.
pub const API_VERSION: &str = "45.0";

const COMETD_PATH: &str = "cometd";

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Streaming endpoint of an instance.
pub fn cometd_url(instance_url: &str) -> String {
    format!(
        "{}/{}/{}",
        instance_url.trim_end_matches('/'),
        COMETD_PATH,
        API_VERSION
    )
}

/// An access token and the instance it is valid for.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub instance_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, instance_url: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            instance_url: instance_url.into(),
            id: None,
            issued_at: None,
            signature: None,
        }
    }

    /// Value of the `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    pub fn streaming_url(&self) -> String {
        cometd_url(&self.instance_url)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"***")
            .field("token_type", &self.token_type)
            .field("instance_url", &self.instance_url)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Source of credentials, consulted on every `open`.
pub trait CredentialProvider: Send + Sync {
    fn authenticate(&self) -> Result<Credentials>;
}

impl<P: CredentialProvider + ?Sized> CredentialProvider for Arc<P> {
    fn authenticate(&self) -> Result<Credentials> {
        (**self).authenticate()
    }
}

/// Credentials acquired elsewhere.
#[derive(Clone, Debug)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

impl CredentialProvider for StaticCredentials {
    fn authenticate(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

/// Which login server issues tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginDomain {
    Production,
    Sandbox,
    /// My Domain prefix, e.g. `acme` for `acme.my`.
    Custom(String),
}

impl LoginDomain {
    pub fn host(&self) -> &str {
        match self {
            LoginDomain::Production => "login",
            LoginDomain::Sandbox => "test",
            LoginDomain::Custom(domain) => domain,
        }
    }

    pub fn token_url(&self) -> String {
        format!("https://{}.salesforce.com/services/oauth2/token", self.host())
    }
}

/// OAuth2 grant used to obtain a token.
#[derive(Clone, PartialEq, Eq)]
pub enum TokenGrant {
    Password {
        consumer_key: String,
        consumer_secret: String,
        username: String,
        password: String,
    },
    RefreshToken {
        consumer_key: String,
        consumer_secret: String,
        refresh_token: String,
    },
}

impl TokenGrant {
    /// Form fields of the token request.
    pub fn form(&self) -> Vec<(&'static str, String)> {
        match self {
            TokenGrant::Password {
                consumer_key,
                consumer_secret,
                username,
                password,
            } => vec![
                ("grant_type", "password".to_string()),
                ("client_id", consumer_key.clone()),
                ("client_secret", consumer_secret.clone()),
                ("username", username.clone()),
                ("password", password.clone()),
            ],
            TokenGrant::RefreshToken {
                consumer_key,
                consumer_secret,
                refresh_token,
            } => vec![
                ("grant_type", "refresh_token".to_string()),
                ("client_id", consumer_key.clone()),
                ("client_secret", consumer_secret.clone()),
                ("refresh_token", refresh_token.clone()),
            ],
        }
    }

    /// Sandbox users log in as `<username>.<sandbox name>`.
    pub fn in_sandbox(self, sandbox_name: &str) -> Self {
        match self {
            TokenGrant::Password {
                consumer_key,
                consumer_secret,
                username,
                password,
            } => TokenGrant::Password {
                consumer_key,
                consumer_secret,
                username: format!("{}.{}", username, sandbox_name),
                password,
            },
            grant => grant,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            TokenGrant::Password { .. } => "password",
            TokenGrant::RefreshToken { .. } => "refresh_token",
        }
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenGrant::Password {
                consumer_key,
                username,
                ..
            } => f
                .debug_struct("Password")
                .field("consumer_key", consumer_key)
                .field("consumer_secret", &"***")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            TokenGrant::RefreshToken { consumer_key, .. } => f
                .debug_struct("RefreshToken")
                .field("consumer_key", consumer_key)
                .field("consumer_secret", &"***")
                .field("refresh_token", &"***")
                .finish(),
        }
    }
}

/// Raw response of the token endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Posts a url-encoded form. Implemented over the application's HTTP client.
pub trait TokenExchange: Send + Sync {
    fn post_form(&self, url: &str, form: &[(&'static str, String)]) -> Result<TokenResponse>;
}

/// OAuth2 credential provider.
pub struct OAuthCredentials<E> {
    grant: TokenGrant,
    domain: LoginDomain,
    exchange: E,
    codec: Arc<dyn JsonCodec>,
}

impl<E: TokenExchange> OAuthCredentials<E> {
    /// Log in to production.
    pub fn new(grant: TokenGrant, exchange: E) -> Self {
        Self::with_domain(grant, LoginDomain::Production, exchange)
    }

    /// Log in to the sandbox `sandbox_name`.
    pub fn sandbox(grant: TokenGrant, sandbox_name: &str, exchange: E) -> Self {
        Self::with_domain(grant.in_sandbox(sandbox_name), LoginDomain::Sandbox, exchange)
    }

    /// Log in through a My Domain login server.
    pub fn custom_domain(grant: TokenGrant, domain: impl Into<String>, exchange: E) -> Self {
        Self::with_domain(grant, LoginDomain::Custom(domain.into()), exchange)
    }

    fn with_domain(grant: TokenGrant, domain: LoginDomain, exchange: E) -> Self {
        Self {
            grant,
            domain,
            exchange,
            codec: Arc::new(SerdeJsonCodec),
        }
    }

    /// Decode token responses with `codec`.
    pub fn with_codec(mut self, codec: Arc<dyn JsonCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn domain(&self) -> &LoginDomain {
        &self.domain
    }

    pub fn grant(&self) -> &TokenGrant {
        &self.grant
    }
}

impl<E: TokenExchange> CredentialProvider for OAuthCredentials<E> {
    fn authenticate(&self) -> Result<Credentials> {
        let url = self.domain.token_url();
        debug!(url = %url, grant = self.grant.kind(), "Requesting access token");

        let response = self
            .exchange
            .post_form(&url, &self.grant.form())
            .map_err(|e| StreamError::Authentication(format!("Network request failed: {}", e)))?;

        if response.status != 200 {
            return Err(StreamError::Authentication(format!(
                "Authentication failed: status {}, {}",
                response.status,
                String::from_utf8_lossy(&response.body)
            )));
        }

        let credentials = self
            .codec
            .decode(&response.body)
            .and_then(|value| Ok(serde_json::from_value::<Credentials>(value)?))
            .map_err(|e| {
                StreamError::Authentication(format!("Malformed token response: {}", e))
            })?;

        info!(instance_url = %credentials.instance_url, "Authenticated");
        Ok(credentials)
    }
}

impl<E> fmt::Debug for OAuthCredentials<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("grant", &self.grant)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}
