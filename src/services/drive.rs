use crate::core::config::Config;
use crate::core::model::{FOLDER_MIME_TYPE, RemoteEntry, RemoteFile, RemoteFolder};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// The slice of a remote file store the copy engine needs.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn get_metadata(&self, id: &str) -> Result<RemoteFolder>;
    /// Immediate children of `parent_id`, trashed entries excluded.
    async fn list_children(&self, parent_id: &str) -> Result<Vec<RemoteEntry>>;
    /// Creates a folder under `parent_id`, or at the root when `None`.
    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<RemoteFolder>;
    async fn copy_file(&self, id: &str, dest_parent_id: &str) -> Result<RemoteFile>;
}

/// Builds a storage handle for one bearer token.
pub trait StorageConnector: Send + Sync {
    fn connect(&self, token: &str) -> Result<Arc<dyn RemoteStorage>>;
}

// --- Drive v3 wire types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    parents: Vec<String>,
    /// Drive encodes int64 as a JSON string.
    size: Option<String>,
}

impl DriveFile {
    fn into_folder(self) -> RemoteFolder {
        RemoteFolder {
            id: self.id,
            name: self.name,
            mime_type: self.mime_type,
            parent_ids: self.parents,
        }
    }

    fn into_file(self) -> RemoteFile {
        RemoteFile {
            size: self.size.as_deref().and_then(|s| s.parse().ok()),
            id: self.id,
            name: self.name,
            mime_type: self.mime_type,
        }
    }

    fn into_entry(self) -> RemoteEntry {
        if self.mime_type == FOLDER_MIME_TYPE {
            RemoteEntry::Folder(self.into_folder())
        } else {
            RemoteEntry::File(self.into_file())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveErrorBody {
    error: Option<DriveErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct DriveErrorDetail {
    message: Option<String>,
}

/// Turns a failed response into an error that keeps Drive's message and the
/// HTTP status, which access checks rely on for classification.
async fn api_error(action: &str, resp: reqwest::Response) -> anyhow::Error {
    let status = resp.status();
    let fallback = status.canonical_reason().unwrap_or("Unknown error").to_string();
    let message = match resp.json::<DriveErrorBody>().await {
        Ok(body) => body.error.and_then(|e| e.message).unwrap_or(fallback),
        Err(_) => fallback,
    };
    anyhow::anyhow!("{}: {} (HTTP {})", action, message, status.as_u16())
}

fn parents_query(parent_id: &str) -> String {
    format!("'{}' in parents and trashed = false", parent_id.replace('\'', "\\'"))
}

pub struct DriveClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    page_size: u32,
}

impl DriveClient {
    pub fn new(http: reqwest::Client, base_url: &str, token: &str, page_size: u32) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            page_size,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl RemoteStorage for DriveClient {
    async fn get_metadata(&self, id: &str) -> Result<RemoteFolder> {
        let resp = self
            .http
            .get(self.url(&format!("/files/{}", id)))
            .bearer_auth(&self.token)
            .query(&[
                ("supportsAllDrives", "true"),
                ("fields", "id,name,mimeType,parents"),
            ])
            .send()
            .await
            .context("Failed to get folder info")?;

        if !resp.status().is_success() {
            return Err(api_error("Failed to get folder info", resp).await);
        }
        let file: DriveFile = resp.json().await.context("Failed to decode folder info")?;
        Ok(file.into_folder())
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<RemoteEntry>> {
        let q = parents_query(parent_id);
        let page_size = self.page_size.to_string();
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .http
                .get(self.url("/files"))
                .bearer_auth(&self.token)
                .query(&[
                    ("q", q.as_str()),
                    ("supportsAllDrives", "true"),
                    ("includeItemsFromAllDrives", "true"),
                    (
                        "fields",
                        "nextPageToken,files(id,name,mimeType,size,parents)",
                    ),
                    ("pageSize", page_size.as_str()),
                ]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }

            let resp = req.send().await.context("Failed to list folder contents")?;
            if !resp.status().is_success() {
                return Err(api_error("Failed to list folder contents", resp).await);
            }
            let page: DriveFileList = resp
                .json()
                .await
                .context("Failed to decode folder listing")?;

            entries.extend(page.files.into_iter().map(DriveFile::into_entry));

            match page.next_page_token {
                Some(token) if !token.is_empty() => {
                    debug!("Listing {} continues (have {} entries)", parent_id, entries.len());
                    page_token = Some(token);
                }
                _ => break,
            }
        }

        Ok(entries)
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<RemoteFolder> {
        let mut body = json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
        });
        if let Some(parent) = parent_id {
            body["parents"] = json!([parent]);
        }

        let resp = self
            .http
            .post(self.url("/files"))
            .bearer_auth(&self.token)
            .query(&[
                ("supportsAllDrives", "true"),
                ("fields", "id,name,mimeType,parents"),
            ])
            .json(&body)
            .send()
            .await
            .context("Failed to create folder")?;

        if !resp.status().is_success() {
            return Err(api_error("Failed to create folder", resp).await);
        }
        let file: DriveFile = resp.json().await.context("Failed to decode created folder")?;
        Ok(file.into_folder())
    }

    async fn copy_file(&self, id: &str, dest_parent_id: &str) -> Result<RemoteFile> {
        let resp = self
            .http
            .post(self.url(&format!("/files/{}/copy", id)))
            .bearer_auth(&self.token)
            .query(&[
                ("supportsAllDrives", "true"),
                ("fields", "id,name,mimeType,size"),
            ])
            .json(&json!({ "parents": [dest_parent_id] }))
            .send()
            .await
            .context("Failed to copy file")?;

        if !resp.status().is_success() {
            return Err(api_error("Failed to copy file", resp).await);
        }
        let file: DriveFile = resp.json().await.context("Failed to decode copied file")?;
        Ok(file.into_file())
    }
}

pub struct DriveConnector {
    http: reqwest::Client,
    base_url: String,
    page_size: u32,
}

impl DriveConnector {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: config.drive_api_base.clone(),
            page_size: config.list_page_size,
        })
    }
}

impl StorageConnector for DriveConnector {
    fn connect(&self, token: &str) -> Result<Arc<dyn RemoteStorage>> {
        if token.trim().is_empty() {
            anyhow::bail!("Drive token is empty");
        }
        Ok(Arc::new(DriveClient::new(
            self.http.clone(),
            &self.base_url,
            token,
            self.page_size,
        )))
    }
}
