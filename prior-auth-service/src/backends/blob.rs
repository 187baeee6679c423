use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use super::{BackendError, BlobStore, is_url};

const SERVICE: &str = "blob storage";

/// Blob store rooted at a local directory. Remote paths map to files below
/// the root; URLs are fetched over HTTP.
pub struct LocalBlobStore {
    root: PathBuf,
    client: Client,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            client: Client::new(),
        }
    }

    /// Map a location to a file below the root. Parent-directory segments
    /// are refused so nothing resolves outside the root.
    fn resolve(&self, location: &str) -> Result<PathBuf, BackendError> {
        let relative = Path::new(
            location
                .strip_prefix("file://")
                .unwrap_or(location)
                .trim_start_matches('/'),
        );
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(BackendError::InvalidPath(location.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn write(&self, remote_path: &str, bytes: &[u8]) -> Result<String, BackendError> {
        let target = self.resolve(remote_path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        debug!(path = %target.display(), "Blob written");
        Ok(remote_path.to_string())
    }
}

async fn fetch_url(client: &Client, url: &str) -> Result<Option<Vec<u8>>, BackendError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(BackendError::Status {
            service: SERVICE,
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        });
    }
    Ok(Some(response.bytes().await?.to_vec()))
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn download_bytes(&self, location: &str) -> Result<Option<Vec<u8>>, BackendError> {
        if is_url(location) {
            return fetch_url(&self.client, location).await;
        }
        match tokio::fs::read(self.resolve(location)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<String, BackendError> {
        let bytes = tokio::fs::read(local_path).await?;
        self.write(remote_path, &bytes).await
    }

    async fn copy(&self, source_url: &str, remote_path: &str) -> Result<String, BackendError> {
        let bytes = self
            .download_bytes(source_url)
            .await?
            .ok_or_else(|| BackendError::NotFound(source_url.to_string()))?;
        self.write(remote_path, &bytes).await
    }
}

/// Azure blob container addressed with a SAS token
pub struct AzureBlobStore {
    client: Client,
    account_name: String,
    container: String,
    sas_token: String,
}

impl AzureBlobStore {
    pub fn new(
        account_name: impl Into<String>,
        container: impl Into<String>,
        sas_token: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            account_name: account_name.into(),
            container: container.into(),
            sas_token: sas_token.into().trim_start_matches('?').to_string(),
        }
    }

    /// Blob URL without credentials
    pub fn blob_url(&self, remote_path: &str) -> String {
        let encoded: Vec<String> = remote_path
            .trim_start_matches('/')
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!(
            "https://{}.blob.core.windows.net/{}/{}",
            self.account_name,
            self.container,
            encoded.join("/")
        )
    }

    fn signed(&self, url: &str) -> String {
        if self.sas_token.is_empty() || url.contains('?') {
            url.to_string()
        } else {
            format!("{}?{}", url, self.sas_token)
        }
    }

    fn signed_location(&self, location: &str) -> String {
        if is_url(location) {
            self.signed(location)
        } else {
            self.signed(&self.blob_url(location))
        }
    }

    async fn check(response: reqwest::Response) -> Result<(), BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(BackendError::Status {
            service: SERVICE,
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn download_bytes(&self, location: &str) -> Result<Option<Vec<u8>>, BackendError> {
        fetch_url(&self.client, &self.signed_location(location)).await
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<String, BackendError> {
        let bytes = tokio::fs::read(local_path).await?;
        let url = self.blob_url(remote_path);

        let response = self
            .client
            .put(self.signed(&url))
            .header("x-ms-blob-type", "BlockBlob")
            .body(bytes)
            .send()
            .await?;
        Self::check(response).await?;

        info!(url = %url, "Uploaded blob");
        Ok(url)
    }

    async fn copy(&self, source_url: &str, remote_path: &str) -> Result<String, BackendError> {
        let url = self.blob_url(remote_path);

        let response = self
            .client
            .put(self.signed(&url))
            .header("x-ms-copy-source", self.signed(source_url))
            .header("Content-Length", "0")
            .send()
            .await?;
        Self::check(response).await?;

        info!(source = %source_url, url = %url, "Copied blob");
        Ok(url)
    }
}
