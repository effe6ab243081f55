use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::oauth::{OAuthError, OAuthToken, request_token};

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// The fields of a Google service account key file that token minting needs.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
}

/// Exchanges a signed RS256 assertion for an access token
/// (`urn:ietf:params:oauth:grant-type:jwt-bearer`).
#[derive(Clone)]
pub struct ServiceAccountClient {
    http: Client,
    token_url: Url,
    client_email: String,
    signing_key: EncodingKey,
    scope: String,
}

impl ServiceAccountClient {
    pub fn new(key: &ServiceAccountKey) -> Result<Self, OAuthError> {
        Self::build(Url::parse(&key.token_uri)?, key)
    }

    /// Sends token requests to `<base_url>/token` instead of the key's `token_uri`.
    pub fn with_base_url(base_url: &str, key: &ServiceAccountKey) -> Result<Self, OAuthError> {
        Self::build(Url::parse(base_url)?.join("/token")?, key)
    }

    fn build(token_url: Url, key: &ServiceAccountKey) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::new(),
            token_url,
            client_email: key.client_email.clone(),
            signing_key: EncodingKey::from_rsa_pem(key.private_key.as_bytes())?,
            scope: DRIVE_SCOPE.to_string(),
        })
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    pub async fn fetch_token(&self) -> Result<OAuthToken, OAuthError> {
        let assertion = self.assertion(now_unix())?;
        let form = [
            ("grant_type", JWT_BEARER_GRANT),
            ("assertion", assertion.as_str()),
        ];
        request_token(&self.http, self.token_url.clone(), &form).await
    }

    fn assertion(&self, issued_at: u64) -> Result<String, OAuthError> {
        let claims = AssertionClaims {
            iss: self.client_email.clone(),
            scope: self.scope.clone(),
            aud: self.token_url.to_string(),
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.signing_key,
        )?)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
