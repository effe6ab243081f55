use std::future::Future;
use std::path::{Path, PathBuf};

use gdrive_core::{
    DriveClient, DriveError, DriveFile, FileList, OAuthClient, OAuthError, OAuthToken,
    ServiceAccountClient, ServiceAccountKey, StatusCode,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::CopyConfig;
use crate::remote::store::RemoteStore;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to read credentials {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid credentials file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("drive client error: {0}")]
    Drive(#[from] DriveError),
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
}

/// Contents of the credentials file: an OAuth `authorized_user` record, a
/// service account key, or a bare access token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    ServiceAccount(ServiceAccountKey),
    AccessToken {
        access_token: String,
    },
}

impl Credentials {
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let content = std::fs::read_to_string(path).map_err(|source| SessionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| SessionError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

enum Refresher {
    RefreshToken {
        client: OAuthClient,
        refresh_token: String,
    },
    ServiceAccount(ServiceAccountClient),
}

impl Refresher {
    async fn fetch(&mut self) -> Result<OAuthToken, OAuthError> {
        match self {
            Refresher::RefreshToken {
                client,
                refresh_token,
            } => {
                let token = client.refresh_token(refresh_token.as_str()).await?;
                if let Some(rotated) = &token.refresh_token {
                    refresh_token.clone_from(rotated);
                }
                Ok(token)
            }
            Refresher::ServiceAccount(client) => client.fetch_token().await,
        }
    }
}

pub struct TokenProvider {
    access_token: String,
    expires_at: Option<i64>,
    refresher: Option<Refresher>,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    /// A token that is used as-is and never refreshed.
    pub fn fixed(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
            refresher: None,
            refresh_skew_secs: 60,
        }
    }

    /// Starts without an access token; the first request triggers a refresh.
    pub fn refreshing(client: OAuthClient, refresh_token: impl Into<String>) -> Self {
        Self::minting(Refresher::RefreshToken {
            client,
            refresh_token: refresh_token.into(),
        })
    }

    /// Mints a token from a signed assertion whenever the current one expires.
    pub fn service_account(client: ServiceAccountClient) -> Self {
        Self::minting(Refresher::ServiceAccount(client))
    }

    fn minting(refresher: Refresher) -> Self {
        Self {
            access_token: String::new(),
            expires_at: Some(0),
            refresher: Some(refresher),
            refresh_skew_secs: 60,
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresher.is_some()
    }

    pub async fn valid_access_token(&mut self) -> Result<String, OAuthError> {
        if self.should_refresh() {
            self.refresh().await?;
        }
        Ok(self.access_token.clone())
    }

    pub async fn refresh_now(&mut self) -> Result<String, OAuthError> {
        self.refresh().await?;
        Ok(self.access_token.clone())
    }

    fn should_refresh(&self) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        self.refresher.is_some() && expires_at <= now_unix().saturating_add(self.refresh_skew_secs)
    }

    async fn refresh(&mut self) -> Result<(), OAuthError> {
        let Some(refresher) = self.refresher.as_mut() else {
            return Ok(());
        };
        let token = refresher.fetch().await?;
        self.access_token = token.access_token;
        self.expires_at = token
            .expires_in
            .map(|secs| now_unix().saturating_add(secs.min(i64::MAX as u64) as i64));
        debug!(expires_at = ?self.expires_at, "access token refreshed");
        Ok(())
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Authenticated Drive access. Keeps the bearer token fresh before every
/// request and retries once with a new token after a 401.
pub struct DriveSession {
    client: DriveClient,
    tokens: Mutex<TokenProvider>,
}

impl DriveSession {
    pub fn new(client: DriveClient, tokens: TokenProvider) -> Self {
        Self {
            client,
            tokens: Mutex::new(tokens),
        }
    }

    /// Builds a session from configuration. A configured access token wins
    /// over the credentials file.
    pub fn from_config(config: &CopyConfig) -> Result<Self, SessionError> {
        let tokens = match config.access_token.as_deref() {
            Some(token) => TokenProvider::fixed(token),
            None => match Credentials::load(&config.credentials_path)? {
                Credentials::AccessToken { access_token } => TokenProvider::fixed(access_token),
                Credentials::AuthorizedUser {
                    client_id,
                    client_secret,
                    refresh_token,
                } => {
                    let oauth = match config.oauth_base_url.as_deref() {
                        Some(url) => OAuthClient::with_base_url(url, client_id, client_secret)?,
                        None => OAuthClient::new(client_id, client_secret)?,
                    };
                    TokenProvider::refreshing(oauth, refresh_token)
                }
                Credentials::ServiceAccount(key) => {
                    let client = match config.oauth_base_url.as_deref() {
                        Some(url) => ServiceAccountClient::with_base_url(url, &key)?,
                        None => ServiceAccountClient::new(&key)?,
                    };
                    debug!(account = %client.client_email(), "using service account");
                    TokenProvider::service_account(client)
                }
            },
        };
        let client = match config.api_base_url.as_deref() {
            Some(url) => DriveClient::with_base_url(url, "")?,
            None => DriveClient::new("")?,
        };
        Ok(Self::new(client, tokens))
    }

    pub fn client(&self) -> &DriveClient {
        &self.client
    }

    async fn can_refresh(&self) -> bool {
        self.tokens.lock().await.can_refresh()
    }

    async fn authorize(&self, force: bool) -> Result<(), DriveError> {
        let mut tokens = self.tokens.lock().await;
        let token = if force {
            tokens.refresh_now().await?
        } else {
            tokens.valid_access_token().await?
        };
        self.client.set_token(token);
        Ok(())
    }

    async fn authorized<T, F, Fut>(&self, call: F) -> Result<T, DriveError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, DriveError>>,
    {
        self.authorize(false).await?;
        let result = call().await;
        let rejected = matches!(&result, Err(err) if err.status() == Some(StatusCode::UNAUTHORIZED));
        if rejected && self.can_refresh().await {
            debug!("access token rejected, refreshing");
            self.authorize(true).await?;
            return call().await;
        }
        result
    }
}

impl RemoteStore for DriveSession {
    async fn get_file(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        self.authorized(|| self.client.get_file(file_id)).await
    }

    async fn list_children_page(
        &self,
        folder_id: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<FileList, DriveError> {
        self.authorized(|| self.client.list_children_page(folder_id, page_size, page_token))
            .await
    }

    async fn find_by_name(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<FileList, DriveError> {
        self.authorized(|| self.client.find_by_name(name, parent_id))
            .await
    }

    async fn create_folder(&self, name: &str) -> Result<DriveFile, DriveError> {
        self.authorized(|| self.client.create_folder(name)).await
    }

    async fn copy_file(
        &self,
        file_id: &str,
        name: &str,
        parent_id: &str,
    ) -> Result<DriveFile, DriveError> {
        self.authorized(|| self.client.copy_file(file_id, name, parent_id))
            .await
    }

    async fn update_parents(
        &self,
        file_id: &str,
        add_parent: &str,
        remove_parents: &[String],
    ) -> Result<DriveFile, DriveError> {
        self.authorized(|| {
            self.client
                .update_parents(file_id, add_parent, remove_parents)
        })
        .await
    }

    async fn trash_file(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        self.authorized(|| self.client.trash_file(file_id)).await
    }

    async fn download_to_path(&self, file_id: &str, target: &Path) -> Result<u64, DriveError> {
        self.authorized(|| self.client.download_to_path(file_id, target))
            .await
    }
}
