//! S3-compatible storage backend.
//!
//! Works with AWS S3, MinIO, R2 and other S3-compatible stores:
//! - Streaming reads straight from the `GetObject` body
//! - Streaming writes through a background multipart upload
//! - Paginated `ListObjectsV2` walks

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{http::HttpResponse, BehaviorVersion, Builder, Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::backend::{
    cancellable, normalize_path, BoxWriter, StorageBackend, StorageError, StorageFile,
    StorageResult, WalkFn,
};
use super::pipe::{CancellableReader, PipeReader, StreamingWriter};

/// Size of each multipart upload part. Objects smaller than this are sent
/// with a single `PutObject`.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// Static S3 credentials
#[derive(Clone, Deserialize)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// S3 storage backend configuration
#[derive(Clone, Debug, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, R2, etc.)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Force path-style URLs (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Explicit credentials. When absent the SDK default provider chain is used.
    #[serde(default)]
    pub credentials: Option<S3Credentials>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl S3Config {
    /// Create config for AWS S3
    pub fn aws(bucket: String, region: String) -> Self {
        Self {
            bucket,
            region,
            endpoint: None,
            force_path_style: false,
            credentials: None,
        }
    }

    /// Create config for MinIO or other S3-compatible storage
    pub fn minio(bucket: String, endpoint: String) -> Self {
        Self {
            bucket,
            region: default_region(), // MinIO doesn't care about region
            endpoint: Some(endpoint),
            force_path_style: true,
            credentials: None,
        }
    }

    /// Use static credentials instead of the default provider chain
    pub fn with_credentials(mut self, access_key_id: &str, secret_access_key: &str) -> Self {
        self.credentials = Some(S3Credentials {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token: None,
        });
        self
    }
}

/// S3-compatible storage backend
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// Create a new S3 storage backend from config
    pub async fn new(config: S3Config) -> Self {
        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .force_path_style(config.force_path_style);

        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        match config.credentials {
            Some(creds) => {
                builder = builder.credentials_provider(Credentials::new(
                    creds.access_key_id,
                    creds.secret_access_key,
                    creds.session_token,
                    None,
                    "static",
                ));
            }
            None => {
                let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .load()
                    .await;
                if let Some(creds) = sdk_config.credentials_provider() {
                    builder = builder.credentials_provider(creds);
                }
            }
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
        }
    }

    /// Wrap an already configured client
    pub fn from_client(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

fn is_not_found_response(status: Option<u16>, code: Option<&str>) -> bool {
    status == Some(404) || matches!(code, Some("NoSuchKey") | Some("NotFound"))
}

fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, path: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    if is_not_found_response(status, err.code()) {
        StorageError::NotFound(path.to_string())
    } else {
        StorageError::Transport(DisplayErrorContext(&err).to_string())
    }
}

/// Size advertised by `GetObject`. Callers rely on it, so a missing or
/// negative length is a transport error rather than zero.
fn object_size(content_length: Option<i64>, path: &str) -> StorageResult<u64> {
    content_length
        .and_then(|len| u64::try_from(len).ok())
        .ok_or_else(|| {
            StorageError::Transport(format!("GetObject for {} returned no content length", path))
        })
}

/// Read up to `limit` bytes, stopping early only at EOF.
async fn read_part<R>(reader: &mut R, limit: usize) -> StorageResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(limit);
    while buf.len() < limit {
        let remaining = (limit - buf.len()) as u64;
        let n = (&mut *reader).take(remaining).read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    Ok(buf.freeze())
}

/// Background half of an S3 writer.
async fn upload_object(
    client: Client,
    bucket: String,
    key: String,
    mut body: PipeReader,
    cancel: CancellationToken,
) -> StorageResult<()> {
    let first = read_part(&mut body, PART_SIZE).await?;
    if first.len() < PART_SIZE {
        let len = first.len();
        cancellable(&cancel, async {
            client
                .put_object()
                .bucket(&bucket)
                .key(&key)
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &key))
        })
        .await?;
        tracing::debug!(bucket = %bucket, key = %key, bytes = len, "uploaded object");
        return Ok(());
    }

    let created = cancellable(&cancel, async {
        client
            .create_multipart_upload()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &key))
    })
    .await?;
    let upload_id = created
        .upload_id()
        .ok_or_else(|| {
            StorageError::Transport("CreateMultipartUpload returned no upload id".into())
        })?
        .to_string();

    let result = upload_parts(&client, &bucket, &key, &upload_id, first, &mut body, &cancel).await;
    if let Err(e) = &result {
        tracing::debug!(bucket = %bucket, key = %key, error = %e, "aborting multipart upload");
        // Not cancellable: this is the cleanup for a cancelled upload.
        if let Err(abort_err) = client
            .abort_multipart_upload()
            .bucket(&bucket)
            .key(&key)
            .upload_id(&upload_id)
            .send()
            .await
        {
            tracing::warn!(
                bucket = %bucket,
                key = %key,
                error = %DisplayErrorContext(&abort_err),
                "failed to abort multipart upload"
            );
        }
    }
    result
}

async fn upload_parts(
    client: &Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    first: Bytes,
    body: &mut PipeReader,
    cancel: &CancellationToken,
) -> StorageResult<()> {
    let mut parts = Vec::new();
    let mut part = first;
    let mut number: i32 = 1;

    loop {
        let uploaded = cancellable(cancel, async {
            client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|e| map_sdk_error(e, key))
        })
        .await?;
        parts.push(
            CompletedPart::builder()
                .set_e_tag(uploaded.e_tag().map(str::to_string))
                .part_number(number)
                .build(),
        );

        part = read_part(body, PART_SIZE).await?;
        if part.is_empty() {
            break;
        }
        number += 1;
    }

    cancellable(cancel, async {
        client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))
    })
    .await?;
    tracing::debug!(bucket, key, parts = number, "completed multipart upload");
    Ok(())
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn open(&self, path: &str, cancel: &CancellationToken) -> StorageResult<StorageFile> {
        let key = normalize_path(path);
        let result = cancellable(cancel, async {
            self.client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, path))
        })
        .await?;

        let size = object_size(result.content_length(), path)?;
        let modified = result
            .last_modified()
            .and_then(|t| SystemTime::try_from(t.clone()).ok());
        let body = Box::pin(result.body.into_async_read());
        let reader = CancellableReader::new(body, cancel.clone());

        Ok(StorageFile::new(Box::new(reader), path, size).with_modified(modified))
    }

    async fn create(&self, path: &str, cancel: &CancellationToken) -> StorageResult<BoxWriter> {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = normalize_path(path).to_string();
        Ok(Box::new(StreamingWriter::new(path, cancel, move |body, token| {
            upload_object(client, bucket, key, body, token)
        })))
    }

    /// S3 acknowledges deletes of missing keys, so existence is checked first
    /// to report `NotFound` like the other backends. A concurrent delete
    /// between the two calls still succeeds.
    async fn delete(&self, path: &str, cancel: &CancellationToken) -> StorageResult<()> {
        let key = normalize_path(path);
        cancellable(cancel, async {
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, path))?;
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, path))
        })
        .await?;
        Ok(())
    }

    async fn walk(
        &self,
        prefix: &str,
        visit: &mut WalkFn<'_>,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        let prefix = normalize_path(prefix);
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let result = cancellable(cancel, async {
                request
                    .send()
                    .await
                    .map_err(|e| StorageError::Transport(DisplayErrorContext(&e).to_string()))
            })
            .await?;

            for key in result.contents().iter().filter_map(|obj| obj.key()) {
                visit(key)?;
            }

            if result.is_truncated().unwrap_or(false) {
                continuation_token = result.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(())
    }
}
