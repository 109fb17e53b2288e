//! Cloudflare R2 blob store for the registry document
//!
//! R2 is S3-compatible, so we use aws-sdk-s3 with a custom endpoint. Any
//! other S3-compatible endpoint works the same way.
//!
//! Connection settings come from a single URL:
//!
//! ```text
//! r2://<access_key_id>:<secret_access_key>@<account_id>/<bucket>
//! https://<access_key_id>:<secret_access_key>@<host>[:port]/<bucket>
//! ```
//!
//! Credentials may be percent-encoded.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Builder, Credentials, Region},
    error::SdkError,
    operation::{get_object::GetObjectError, head_object::HeadObjectError},
    primitives::ByteStream,
    Client as S3Client,
};
use percent_encoding::percent_decode_str;
use std::fmt;
use tracing::{debug, info, instrument};
use url::Url;

use super::{BlobStore, StoreError, StoreResult};

/// Parsed R2 / S3 connection settings
#[derive(Clone, PartialEq, Eq)]
pub struct R2Settings {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
}

impl fmt::Debug for R2Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("R2Settings")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("bucket_name", &self.bucket_name)
            .finish()
    }
}

impl R2Settings {
    /// Parse a connection URL (see module docs)
    pub fn from_url(raw: &str) -> StoreResult<Self> {
        let url = Url::parse(raw).map_err(|e| StoreError::Config(format!("Invalid R2 URL: {}", e)))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| StoreError::Config("Missing account id or host in R2 URL".to_string()))?;

        let endpoint = match url.scheme() {
            "r2" => format!("https://{}.r2.cloudflarestorage.com", host),
            "https" | "http" => match url.port() {
                Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
                None => format!("{}://{}", url.scheme(), host),
            },
            other => {
                return Err(StoreError::Config(format!(
                    "Unsupported R2 URL scheme '{}', expected r2, https or http",
                    other
                )))
            }
        };

        let access_key_id = decode(url.username(), "access key id")?;
        let secret_access_key = decode(url.password().unwrap_or(""), "secret access key")?;

        let bucket_name = url.path().trim_matches('/').to_string();
        if bucket_name.is_empty() || bucket_name.contains('/') {
            return Err(StoreError::Config(
                "R2 URL path must be exactly one bucket name".to_string(),
            ));
        }

        Ok(Self {
            endpoint,
            access_key_id,
            secret_access_key,
            bucket_name,
        })
    }
}

fn decode(raw: &str, what: &str) -> StoreResult<String> {
    if raw.is_empty() {
        return Err(StoreError::Config(format!("Missing {} in R2 URL", what)));
    }
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| StoreError::Config(format!("Invalid {} encoding in R2 URL: {}", what, e)))
}

/// R2 client for the registry bucket
#[derive(Clone)]
pub struct R2Client {
    client: S3Client,
    bucket: String,
}

impl R2Client {
    /// Create a new R2 client from settings
    pub fn new(settings: &R2Settings) -> Self {
        debug!("Creating R2 client with endpoint: {}", settings.endpoint);

        let credentials = Credentials::new(
            &settings.access_key_id,
            &settings.secret_access_key,
            None, // session token
            None, // expiry
            "r2-static-credentials",
        );

        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&settings.endpoint)
            .region(Region::new("auto")) // R2 uses "auto" region
            .credentials_provider(credentials)
            .force_path_style(true) // Required for R2
            .build();

        info!(bucket = %settings.bucket_name, "R2 client configured");

        Self {
            client: S3Client::from_conf(config),
            bucket: settings.bucket_name.clone(),
        }
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl BlobStore for R2Client {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let result = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(result) => result,
            Err(e) if is_missing_object(&e) => return Ok(None),
            Err(e) => return Err(StoreError::Unavailable(format!("R2 download failed: {:?}", e))),
        };

        let data = result
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to read R2 body: {:?}", e)))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from R2: {}", data.len(), key);
        Ok(Some(data))
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn put(&self, key: &str, data: Vec<u8>) -> StoreResult<()> {
        let size = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("R2 upload failed: {:?}", e)))?;

        debug!("Uploaded to R2: {} ({} bytes)", key, size);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) if is_missing_head(&e) => Ok(false),
            Err(e) => Err(StoreError::Unavailable(format!("R2 head failed: {:?}", e))),
        }
    }
}

/// Only the service's own NoSuchKey answer means the object is absent.
/// Timeouts, dispatch and parse failures stay errors.
fn is_missing_object(err: &SdkError<GetObjectError>) -> bool {
    err.as_service_error().is_some_and(GetObjectError::is_no_such_key)
}

fn is_missing_head(err: &SdkError<HeadObjectError>) -> bool {
    err.as_service_error().is_some_and(HeadObjectError::is_not_found)
}
