use std::fmt;

use thiserror::Error;

const FOLDER_ID_LEN: usize = 28;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FolderRefError {
    #[error("invalid folder reference {input:?}: expected a Drive folder URL or id")]
    Invalid { input: String },
}

/// A Drive folder id taken from a folder URL such as
/// `https://drive.google.com/drive/folders/<id>?usp=sharing`, or given bare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderId(String);

impl FolderId {
    pub fn parse(input: &str) -> Result<Self, FolderRefError> {
        let trimmed = input.trim();
        let tail = match trimmed.rfind("/folders/") {
            Some(index) => &trimmed[index + "/folders/".len()..],
            None => trimmed,
        };
        let id = tail
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');

        let valid = id.len() == FOLDER_ID_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if valid {
            Ok(Self(id.to_string()))
        } else {
            Err(FolderRefError::Invalid {
                input: input.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
