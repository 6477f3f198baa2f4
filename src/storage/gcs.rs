//! Google Cloud Storage backend over the JSON API.
//!
//! Objects are read with `alt=media` downloads pinned to the generation
//! reported by the metadata request, written with streaming `uploadType=media`
//! uploads, and listed page by page.

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

use super::backend::{
    cancellable, normalize_path, BoxWriter, StorageBackend, StorageError, StorageFile,
    StorageResult, WalkFn,
};
use super::pipe::{CancellableReader, PipeReader, StreamingWriter};

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// GCS backend configuration
#[derive(Clone, Deserialize)]
pub struct GcsConfig {
    /// Bucket name
    pub bucket: String,
    /// API endpoint, overridable for emulators
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// OAuth2 bearer token. Requests are anonymous without one.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

impl fmt::Debug for GcsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcsConfig")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl GcsConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: default_endpoint(),
            token: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct ObjectMetadata {
    /// The JSON API encodes 64-bit integers as strings
    size: String,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
    #[serde(default)]
    generation: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ListedObject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
}

/// Google Cloud Storage backend
pub struct GcsStorage {
    client: Client,
    bucket: String,
    endpoint: Url,
    token: Option<String>,
}

impl GcsStorage {
    pub fn new(config: GcsConfig) -> StorageResult<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            StorageError::InvalidConfig(format!("invalid GCS endpoint {}: {}", config.endpoint, e))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(StorageError::InvalidConfig(format!(
                "invalid GCS endpoint {}",
                config.endpoint
            )));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            client,
            bucket: config.bucket,
            endpoint,
            token: config.token,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Object names are a single path segment, so `/` is percent-encoded.
    fn object_url(&self, name: &str) -> Url {
        self.url(&["storage", "v1", "b", &self.bucket, "o", name])
    }

    fn list_url(&self) -> Url {
        self.url(&["storage", "v1", "b", &self.bucket, "o"])
    }

    fn upload_url(&self, name: &str) -> Url {
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"]);
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", name);
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        authorize(self.client.request(method, url), self.token.as_deref())
    }

    async fn send(&self, request: RequestBuilder, path: &str) -> StorageResult<Response> {
        let response = request.send().await.map_err(StorageError::transport)?;
        check_status(response, path).await
    }
}

fn authorize(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

async fn check_status(response: Response, path: &str) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(StorageError::NotFound(path.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    Err(StorageError::Transport(format!(
        "GCS request for {} failed with {}: {}",
        path,
        status,
        body.trim()
    )))
}

async fn upload_object(
    client: Client,
    url: Url,
    token: Option<String>,
    path: String,
    body: PipeReader,
    cancel: CancellationToken,
) -> StorageResult<()> {
    let request = authorize(client.post(url), token.as_deref())
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(reqwest::Body::wrap_stream(ReaderStream::new(body)));

    cancellable(&cancel, async {
        let response = request.send().await.map_err(StorageError::transport)?;
        check_status(response, &path).await
    })
    .await?;
    tracing::debug!(path = %path, "uploaded object");
    Ok(())
}

#[async_trait]
impl StorageBackend for GcsStorage {
    async fn open(&self, path: &str, cancel: &CancellationToken) -> StorageResult<StorageFile> {
        let name = normalize_path(path);
        let meta_url = self.object_url(name);

        let metadata: ObjectMetadata = cancellable(cancel, async {
            let response = self.send(self.request(Method::GET, meta_url.clone()), path).await?;
            response.json().await.map_err(StorageError::transport)
        })
        .await?;
        let size = metadata.size.parse::<u64>().map_err(|e| {
            StorageError::Transport(format!("bad size {:?} for {}: {}", metadata.size, path, e))
        })?;

        let mut media_url = meta_url;
        {
            let mut query = media_url.query_pairs_mut();
            query.append_pair("alt", "media");
            // Pin the download so a concurrent overwrite can't change the size under us
            if let Some(generation) = &metadata.generation {
                query.append_pair("generation", generation);
            }
        }

        let response =
            cancellable(cancel, self.send(self.request(Method::GET, media_url), path)).await?;
        let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        let reader = CancellableReader::new(StreamReader::new(stream), cancel.clone());

        Ok(StorageFile::new(Box::new(reader), path, size)
            .with_modified(metadata.updated.map(SystemTime::from)))
    }

    async fn create(&self, path: &str, cancel: &CancellationToken) -> StorageResult<BoxWriter> {
        let client = self.client.clone();
        let url = self.upload_url(normalize_path(path));
        let token = self.token.clone();
        let owned_path = path.to_string();
        Ok(Box::new(StreamingWriter::new(path, cancel, move |body, token_cancel| {
            upload_object(client, url, token, owned_path, body, token_cancel)
        })))
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> StorageResult<()> {
        let url = self.object_url(normalize_path(path));
        cancellable(cancel, self.send(self.request(Method::DELETE, url), path)).await?;
        Ok(())
    }

    async fn walk(
        &self,
        prefix: &str,
        visit: &mut WalkFn<'_>,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        let prefix = normalize_path(prefix);
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.list_url();
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                query.append_pair("fields", "items(name),nextPageToken");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let page: ObjectList = cancellable(cancel, async {
                let response = self.send(self.request(Method::GET, url), prefix).await?;
                response.json().await.map_err(StorageError::transport)
            })
            .await?;

            for item in &page.items {
                visit(&item.name)?;
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(())
    }
}
