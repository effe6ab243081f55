mod client;
mod oauth;
mod service_account;

pub use client::{
    ApiErrorClass, DriveClient, DriveError, DriveFile, FOLDER_MIME_TYPE, FileList, escape_query,
};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
pub use reqwest::StatusCode;
pub use service_account::{
    AssertionClaims, DRIVE_SCOPE, ServiceAccountClient, ServiceAccountKey,
};
