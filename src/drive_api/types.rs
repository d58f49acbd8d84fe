use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sync::remote::RemoteObject;

/// File resource as returned by the Drive v3 API. Drive reports `size` as a
/// decimal string and omits it for folders and Google-native documents.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default)]
    pub modified_time: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
}

impl DriveFile {
    pub fn into_remote_object(self) -> Result<RemoteObject> {
        let modified_time = match &self.modified_time {
            Some(t) => Some(
                chrono::DateTime::parse_from_rfc3339(t)
                    .with_context(|| format!("Bad modifiedTime '{t}' on {}", self.id))?
                    .timestamp_millis(),
            ),
            None => None,
        };
        let size = match &self.size {
            Some(s) => s
                .parse()
                .with_context(|| format!("Bad size '{s}' on {}", self.id))?,
            None => 0,
        };

        Ok(RemoteObject {
            id: self.id,
            name: self.name,
            mime_type: self.mime_type,
            modified_time,
            size,
            md5_checksum: self.md5_checksum,
        })
    }
}

/// Paginated response from GET /files.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Metadata body for POST /files.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFileRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

/// Error envelope returned by Google APIs.
#[derive(Debug, Clone, Deserialize)]
pub struct DriveApiError {
    pub error: DriveErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriveErrorBody {
    pub code: u16,
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl fmt::Display for DriveApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Drive API error {}", self.error.code)?;
        if let Some(status) = &self.error.status {
            write!(f, " ({status})")?;
        }
        write!(f, ": {}", self.error.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_listing_entries() {
        let json = r#"{
            "nextPageToken": "tok",
            "files": [
                {"id": "f1", "name": "a.md", "mimeType": "text/markdown",
                 "modifiedTime": "2024-03-01T10:00:00.250Z", "size": "12",
                 "md5Checksum": "abc"},
                {"id": "d1", "name": "docs", "mimeType": "application/vnd.google-apps.folder",
                 "modifiedTime": "2024-03-01T10:00:00Z"}
            ]
        }"#;
        let list: DriveFileList = serde_json::from_str(json).unwrap();
        assert_eq!(list.next_page_token.as_deref(), Some("tok"));

        let objects: Vec<RemoteObject> = list
            .files
            .into_iter()
            .map(|f| f.into_remote_object().unwrap())
            .collect();
        assert_eq!(objects[0].modified_time, Some(1_709_287_200_250));
        assert_eq!(objects[0].size, 12);
        assert_eq!(objects[0].md5_checksum.as_deref(), Some("abc"));
        assert!(objects[1].is_folder());
        assert_eq!(objects[1].size, 0);
    }

    #[test]
    fn rejects_malformed_size() {
        let f = DriveFile {
            id: "x".into(),
            name: "x".into(),
            mime_type: "text/plain".into(),
            modified_time: None,
            size: Some("many".into()),
            md5_checksum: None,
        };
        assert!(f.into_remote_object().is_err());
    }

    #[test]
    fn error_display() {
        let err: DriveApiError = serde_json::from_str(
            r#"{"error": {"code": 404, "message": "File not found: x.", "status": "NOT_FOUND"}}"#,
        )
        .unwrap();
        assert_eq!(
            err.to_string(),
            "Drive API error 404 (NOT_FOUND): File not found: x."
        );
    }
}
