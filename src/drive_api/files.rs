use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;

use crate::sync::remote::{FOLDER_MIME, RemoteObject, RemotePage, RemoteStore};

use super::client::DriveClient;
use super::types::{CreateFileRequest, DriveFile, DriveFileList};

/// Fields requested for single-file responses.
const FILE_FIELDS: &str = "id,name,mimeType,modifiedTime,size,md5Checksum";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,modifiedTime,size,md5Checksum)";
const PAGE_SIZE: &str = "1000";

/// Build a `multipart/related` body carrying file metadata and content,
/// as Drive expects for `uploadType=multipart`.
fn related_body(metadata: &CreateFileRequest, content: &[u8], boundary: &str) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(metadata).context("Failed to encode file metadata")?;
    let mut body = Vec::with_capacity(json.len() + content.len() + 4 * boundary.len() + 128);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(&json);
    body.extend_from_slice(
        format!("\r\n--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    Ok(body)
}

/// Quote a value for use inside a Drive search query.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl DriveClient {
    async fn list_page(&self, q: &str, page_token: Option<&str>) -> Result<DriveFileList> {
        let mut params = vec![
            ("q", q),
            ("fields", LIST_FIELDS),
            ("pageSize", PAGE_SIZE),
            ("spaces", "drive"),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let resp = self
            .api_request(Method::GET, "/files")
            .query(&params)
            .send()
            .await
            .context("Failed to list Drive files")?;

        resp.json().await.context("Failed to parse file list response")
    }

    async fn create_metadata(&self, body: &CreateFileRequest) -> Result<DriveFile> {
        let resp = self
            .api_request(Method::POST, "/files")
            .query(&[("fields", FILE_FIELDS)])
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to create '{}'", body.name))?;

        resp.json().await.context("Failed to parse create response")
    }

    /// Create a file with its content in one request, so a failed upload
    /// never leaves an empty object behind.
    async fn create_with_content(&self, metadata: &CreateFileRequest, content: &[u8]) -> Result<DriveFile> {
        let boundary = format!("gdsyncd-{:016x}", rand::random::<u64>());
        let body = related_body(metadata, content, &boundary)?;

        let resp = self
            .upload_request(Method::POST, "/files")
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(
                "Content-Type",
                &format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload '{}'", metadata.name))?;

        resp.json().await.context("Failed to parse upload response")
    }

    async fn upload_media(&self, file_id: &str, content: Vec<u8>) -> Result<DriveFile> {
        let resp = self
            .upload_request(Method::PATCH, &format!("/files/{file_id}"))
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .header("Content-Type", "application/octet-stream")
            .body(content)
            .send()
            .await
            .with_context(|| format!("Failed to upload content of {file_id}"))?;

        resp.json().await.context("Failed to parse upload response")
    }
}

#[async_trait]
impl RemoteStore for DriveClient {
    async fn list_children(&self, folder_id: &str, page_token: Option<&str>) -> Result<RemotePage> {
        let q = format!("{} in parents and trashed=false", quote(folder_id));
        let page = self
            .list_page(&q, page_token)
            .await
            .with_context(|| format!("Failed to list folder {folder_id}"))?;

        let files = page
            .files
            .into_iter()
            .map(DriveFile::into_remote_object)
            .collect::<Result<Vec<_>>>()?;
        Ok(RemotePage {
            files,
            next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn find_folder(&self, name: &str, parent_id: &str) -> Result<Option<RemoteObject>> {
        let q = format!(
            "name = {} and {} in parents and mimeType = {} and trashed=false",
            quote(name),
            quote(parent_id),
            quote(FOLDER_MIME)
        );
        let page = self
            .list_page(&q, None)
            .await
            .with_context(|| format!("Failed to look up folder '{name}'"))?;

        if page.files.len() > 1 {
            tracing::warn!(name, count = page.files.len(), "several folders share this name, using the first");
        }
        page.files
            .into_iter()
            .next()
            .map(DriveFile::into_remote_object)
            .transpose()
    }

    async fn create_file(&self, name: &str, parent_id: &str, content: Vec<u8>) -> Result<RemoteObject> {
        let metadata = CreateFileRequest {
            name: name.to_string(),
            mime_type: None,
            parents: vec![parent_id.to_string()],
        };
        self.create_with_content(&metadata, &content)
            .await?
            .into_remote_object()
    }

    async fn update_file(&self, id: &str, content: Vec<u8>) -> Result<RemoteObject> {
        self.upload_media(id, content).await?.into_remote_object()
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<RemoteObject> {
        self.create_metadata(&CreateFileRequest {
            name: name.to_string(),
            mime_type: Some(FOLDER_MIME.to_string()),
            parents: parent_id.map(str::to_string).into_iter().collect(),
        })
        .await?
        .into_remote_object()
    }

    async fn delete_object(&self, id: &str) -> Result<()> {
        self.api_request(Method::DELETE, &format!("/files/{id}"))
            .send()
            .await
            .with_context(|| format!("Failed to delete {id}"))?;
        Ok(())
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let resp = self
            .api_request(Method::GET, &format!("/files/{id}"))
            .query(&[("alt", "media")])
            .send()
            .await
            .with_context(|| format!("Failed to download {id}"))?;

        let bytes = resp.bytes().await.context("Failed to read download body")?;
        Ok(bytes.to_vec())
    }
}
