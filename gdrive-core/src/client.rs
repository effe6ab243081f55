use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use futures_util::StreamExt;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const FILE_FIELDS: &str = "id,name,mimeType,size,parents,trashed,createdTime";
const LIST_ORDER: &str = "name,folder,createdTime";
const FIND_PAGE_SIZE: u32 = 10;

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry a path: {0}")]
    CannotBeABase(Url),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("token refresh failed: {0}")]
    OAuth(#[from] crate::OAuthError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    NotFound,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: Arc<RwLock<String>>,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: Arc::new(RwLock::new(token.into())),
        })
    }

    /// Replaces the bearer token used by this client and all of its clones.
    pub fn set_token(&self, token: impl Into<String>) {
        let mut guard = self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = token.into();
    }

    pub async fn get_file(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.files_url(&[file_id])?;
        url.query_pairs_mut()
            .append_pair("fields", FILE_FIELDS)
            .append_pair("supportsAllDrives", "true");
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_children_page(
        &self,
        folder_id: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<FileList, DriveError> {
        let query = format!("'{}' in parents and trashed = false", escape_query(folder_id));
        self.list_files(&query, page_size.max(1), page_token).await
    }

    /// Lists files whose name equals `name` exactly, optionally scoped to a parent.
    ///
    /// Results come back in `name, folder, createdTime` order; callers that want
    /// a single item take the first one.
    pub async fn find_by_name(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<FileList, DriveError> {
        let mut query = format!("name = '{}' and trashed = false", escape_query(name));
        if let Some(parent_id) = parent_id {
            query.push_str(&format!(" and '{}' in parents", escape_query(parent_id)));
        }
        self.list_files(&query, FIND_PAGE_SIZE, None).await
    }

    pub async fn create_folder(&self, name: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.files_url(&[])?;
        url.query_pairs_mut()
            .append_pair("fields", FILE_FIELDS)
            .append_pair("supportsAllDrives", "true");
        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, self.auth_header_value())
            .json(&json!({ "name": name, "mimeType": FOLDER_MIME_TYPE }))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn copy_file(
        &self,
        file_id: &str,
        name: &str,
        parent_id: &str,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.files_url(&[file_id, "copy"])?;
        url.query_pairs_mut()
            .append_pair("fields", FILE_FIELDS)
            .append_pair("supportsAllDrives", "true");
        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, self.auth_header_value())
            .json(&json!({ "name": name, "parents": [parent_id] }))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update_parents(
        &self,
        file_id: &str,
        add_parent: &str,
        remove_parents: &[String],
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.files_url(&[file_id])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("addParents", add_parent);
            if !remove_parents.is_empty() {
                query.append_pair("removeParents", &remove_parents.join(","));
            }
            query.append_pair("fields", FILE_FIELDS);
            query.append_pair("supportsAllDrives", "true");
        }
        let response = self
            .http
            .patch(url)
            .header(AUTHORIZATION, self.auth_header_value())
            .json(&json!({}))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn trash_file(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.files_url(&[file_id])?;
        url.query_pairs_mut()
            .append_pair("fields", FILE_FIELDS)
            .append_pair("supportsAllDrives", "true");
        let response = self
            .http
            .patch(url)
            .header(AUTHORIZATION, self.auth_header_value())
            .json(&json!({ "trashed": true }))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Streams the file content into `target`, returning the number of bytes written.
    ///
    /// Bytes land in a sibling `.partial` file first and are renamed into place
    /// once the body has been fully written.
    pub async fn download_to_path(&self, file_id: &str, target: &Path) -> Result<u64, DriveError> {
        let mut url = self.files_url(&[file_id])?;
        url.query_pairs_mut()
            .append_pair("alt", "media")
            .append_pair("supportsAllDrives", "true");
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&partial, target).await?;
        Ok(written)
    }

    async fn list_files(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<FileList, DriveError> {
        let mut url = self.files_url(&[])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", query);
            pairs.append_pair("orderBy", LIST_ORDER);
            pairs.append_pair("pageSize", &page_size.to_string());
            pairs.append_pair("fields", &format!("nextPageToken,files({FILE_FIELDS})"));
            pairs.append_pair("supportsAllDrives", "true");
            pairs.append_pair("includeItemsFromAllDrives", "true");
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn auth_header_value(&self) -> String {
        let token = self
            .token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        format!("Bearer {}", *token)
    }

    fn files_url(&self, segments: &[&str]) -> Result<Url, DriveError> {
        let mut url = self.base_url.join("/drive/v3/files")?;
        url.path_segments_mut()
            .map_err(|_| DriveError::CannotBeABase(self.base_url.clone()))?
            .extend(segments);
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> DriveError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        DriveError::Api { status, body }
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, body } => Some(classify_api_status(*status, body)),
            DriveError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            // A failing token endpoint is as retryable as a failing API call.
            DriveError::OAuth(crate::OAuthError::Api { status, body }) => {
                Some(classify_api_status(*status, body))
            }
            DriveError::OAuth(crate::OAuthError::Request(err))
                if err.is_timeout() || err.is_connect() =>
            {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.classification() == Some(ApiErrorClass::NotFound)
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DriveError::Api { status, .. } => Some(*status),
            DriveError::Request(err) => err.status(),
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode, body: &str) -> ApiErrorClass {
    // Drive reports quota exhaustion as 403 with a usageLimits reason.
    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN
            && body.to_ascii_lowercase().contains("ratelimitexceeded"))
    {
        ApiErrorClass::RateLimit
    } else if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Escapes a value for use inside a single-quoted Drive query literal.
pub fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: Option<u64>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub created_time: Option<String>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

// The v3 API encodes int64 fields as JSON strings.
fn deserialize_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Number(u64),
        Text(String),
    }

    match Option::<RawSize>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawSize::Number(value)) => Ok(Some(value)),
        Some(RawSize::Text(value)) => value
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
