//! AWS SDK S3 object store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::presigning::{PresignedRequest, PresigningConfig};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use artifact_cache_storage::{
    ByteChunkStream, ByteRange, CompletedPart, ObjectInfo, ObjectMetadata, ObjectStore,
    PresignRequest, StorageError, StorageSettings, TransientKind,
};

use crate::error::S3Error;

/// Credential provider name reported to the SDK.
const PROVIDER_NAME: &str = "artifact-cache";

/// [`ObjectStore`] over one S3 bucket.
///
/// Every request carries the expected bucket owner when one is configured.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    expected_bucket_owner: Option<String>,
}

impl S3ObjectStore {
    /// Build a client from settings.
    ///
    /// Static credentials are used when present, otherwise the SDK's default
    /// provider chain. A custom endpoint switches to path-style addressing
    /// for S3-compatible servers.
    ///
    /// # Arguments
    /// * `settings` - Region, credentials, endpoint and bucket
    pub async fn new(settings: &StorageSettings) -> Result<Self, StorageError> {
        settings.validate()?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let Some(creds) = &settings.credentials {
            loader = loader.credentials_provider(Credentials::new(
                &creds.access_key_id,
                &creds.secret_access_key,
                creds.session_token.clone(),
                None,
                PROVIDER_NAME,
            ));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        log::debug!(
            "S3 store for bucket {} in {}{}",
            settings.bucket,
            settings.region,
            settings
                .endpoint
                .as_deref()
                .map(|e| format!(" via {}", e))
                .unwrap_or_default()
        );

        Ok(Self {
            client: S3Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
            expected_bucket_owner: settings.expected_bucket_owner.clone(),
        })
    }

    /// Wrap an existing S3 client.
    ///
    /// # Arguments
    /// * `client` - Pre-configured S3 client
    /// * `bucket` - Bucket every key lives in
    /// * `expected_bucket_owner` - Optional expected bucket owner
    pub fn from_client(
        client: S3Client,
        bucket: impl Into<String>,
        expected_bucket_owner: Option<String>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            expected_bucket_owner,
        }
    }

    /// Bucket in use.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    dt.to_millis().ok().and_then(DateTime::from_timestamp_millis)
}

fn to_size(length: Option<i64>) -> u64 {
    length.and_then(|l| u64::try_from(l).ok()).unwrap_or(0)
}

fn body_stream(body: ByteStream) -> ByteChunkStream {
    Box::pin(futures::stream::try_unfold(body, |mut body| async move {
        match body.try_next().await {
            Ok(Some(chunk)) => Ok(Some((chunk, body))),
            Ok(None) => Ok(None),
            Err(e) => Err(StorageError::transient(
                TransientKind::ConnectionReset,
                e.to_string(),
            )),
        }
    }))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>, StorageError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(ObjectMetadata {
                size: to_size(output.content_length()),
                last_modified: output.last_modified().and_then(to_chrono),
                content_type: output.content_type().map(String::from),
                etag: output.e_tag().map(String::from),
                user_metadata: output.metadata().cloned().unwrap_or_default(),
            })),
            Err(err) => match S3Error::from_sdk(err).into_storage_error(key) {
                e if e.is_not_found() => Ok(None),
                e => Err(e),
            },
        }
    }

    async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteChunkStream, StorageError> {
        // `bytes=0-0` would ask for one byte, so empty ranges never reach S3.
        if range.as_ref().is_some_and(ByteRange::is_empty) {
            return Ok(Box::pin(futures::stream::empty()));
        }

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range.map(|r| r.to_http_header()))
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| S3Error::from_sdk(err).into_storage_error(key))?;

        Ok(body_stream(output.body))
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .set_content_type(content_type.map(String::from))
            .set_metadata(Some(metadata.clone()))
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| S3Error::from_sdk(err).into_storage_error(key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| S3Error::from_sdk(err).into_storage_error(key))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut objects: Vec<ObjectInfo> = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .set_expected_bucket_owner(self.expected_bucket_owner.clone())
                .send()
                .await
                .map_err(|err| S3Error::from_sdk(err).into_storage_error(prefix))?;

            for obj in response.contents() {
                let Some(key) = obj.key() else { continue };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: to_size(obj.size()),
                    last_modified: obj.last_modified().and_then(to_chrono),
                    etag: obj.e_tag().map(String::from),
                });
            }

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(String::from);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(objects)
    }

    async fn create_multipart(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String, StorageError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(metadata.clone()))
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| S3Error::from_sdk(err).into_storage_error(key))?;

        Ok(output.upload_id().unwrap_or_default().to_string())
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StorageError> {
        let length: i64 = data.len() as i64;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .content_length(length)
            .body(ByteStream::from(data))
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| S3Error::from_sdk(err).into_storage_error(key))?;

        output
            .e_tag()
            .map(String::from)
            .ok_or_else(|| StorageError::Upload {
                code: "MissingETag".into(),
                message: format!("no ETag returned for part {} of {}", part_number, key),
            })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        let completed: Vec<S3CompletedPart> = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| S3Error::from_sdk(err).into_storage_error(key))?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .set_expected_bucket_owner(self.expected_bucket_owner.clone())
            .send()
            .await
            .map_err(|err| S3Error::from_sdk(err).into_storage_error(key))?;
        Ok(())
    }

    async fn presign(
        &self,
        request: &PresignRequest,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let config: PresigningConfig = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::validation(format!("invalid presign TTL {:?}: {}", ttl, e)))?;
        let key: &str = request.key();

        let presigned: PresignedRequest = match request {
            PresignRequest::Get { .. } => self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .set_expected_bucket_owner(self.expected_bucket_owner.clone())
                .presigned(config)
                .await
                .map_err(|err| S3Error::from_sdk(err).into_storage_error(key))?,
            PresignRequest::Put { .. } => self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .set_expected_bucket_owner(self.expected_bucket_owner.clone())
                .presigned(config)
                .await
                .map_err(|err| S3Error::from_sdk(err).into_storage_error(key))?,
        };

        Ok(presigned.uri().to_string())
    }
}
