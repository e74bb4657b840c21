//! In-memory object store with fault injection for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};

use artifact_cache_storage::{
    ByteChunkStream, ByteRange, CompletedPart, ObjectInfo, ObjectMetadata, ObjectStore,
    PresignRequest, StorageError, TransientKind,
};

/// Size of the chunks `get` streams back.
pub const BODY_CHUNK: usize = 64 * 1024;

pub const MIB: usize = 1024 * 1024;

/// Failures the mock injects.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Fail this many `create_multipart` calls with a throttle.
    pub fail_create: u32,
    /// Hand out an empty upload id.
    pub empty_upload_id: bool,
    /// Fail the first N attempts of a given part with a connection reset.
    pub fail_part_times: HashMap<u32, u32>,
    /// This part always fails with a non-retryable upload error.
    pub fatal_part: Option<u32>,
    /// Part uploads never complete.
    pub stall_parts: bool,
    /// Higher part numbers finish first.
    pub reverse_part_delays: bool,
    /// Fixed delay for every part upload.
    pub part_delay: Option<Duration>,
    /// `get` ends the body after this many bytes.
    pub truncate_get: Option<usize>,
    /// The first N `get` calls send one chunk and then hang.
    pub stall_get_times: u32,
    /// The first N `get` calls fail with a transient error.
    pub fail_get_times: u32,
    /// `head` reports this size instead of the real one.
    pub head_size_override: Option<u64>,
    /// Flip the first byte of every `get` body.
    pub corrupt_get: bool,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub content_type: Option<String>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    metadata: HashMap<String, String>,
    parts: HashMap<u32, Vec<u8>>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    clock: i64,
    faults: Faults,
    create_calls: u32,
    get_calls: u32,
    part_attempts: HashMap<u32, u32>,
    completed: Vec<(String, Vec<CompletedPart>)>,
    aborted: Vec<String>,
    in_flight: usize,
    max_in_flight: usize,
}

impl Inner {
    /// Logical clock, one second per committed object.
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        base_time() + chrono::Duration::seconds(self.clock)
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

/// Mock object store for testing.
#[derive(Debug, Clone, Default)]
pub struct MockObjectStore {
    inner: Arc<Mutex<Inner>>,
}

struct InFlightGuard {
    inner: Arc<Mutex<Inner>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.lock().unwrap().in_flight -= 1;
    }
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: Faults) -> Self {
        let store: MockObjectStore = Self::default();
        store.inner.lock().unwrap().faults = faults;
        store
    }

    pub fn set_faults(&self, faults: Faults) {
        self.inner.lock().unwrap().faults = faults;
    }

    /// Store an object directly with the next logical timestamp.
    pub fn insert_object(&self, key: &str, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let now: DateTime<Utc> = inner.tick();
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                metadata: HashMap::new(),
                content_type: None,
                last_modified: now,
            },
        );
    }

    /// Store an object directly with an explicit timestamp.
    pub fn insert_object_at(&self, key: &str, data: &[u8], at: DateTime<Utc>) {
        self.inner.lock().unwrap().objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                metadata: HashMap::new(),
                content_type: None,
                last_modified: at,
            },
        );
    }

    pub fn set_metadata(&self, key: &str, name: &str, value: &str) {
        if let Some(obj) = self.inner.lock().unwrap().objects.get_mut(key) {
            obj.metadata.insert(name.to_string(), value.to_string());
        }
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.inner.lock().unwrap().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().unwrap().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Part lists passed to each successful commit, in commit order.
    pub fn completed_part_lists(&self) -> Vec<(String, Vec<CompletedPart>)> {
        self.inner.lock().unwrap().completed.clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.inner.lock().unwrap().aborted.clone()
    }

    pub fn open_uploads(&self) -> usize {
        self.inner.lock().unwrap().uploads.len()
    }

    pub fn create_calls(&self) -> u32 {
        self.inner.lock().unwrap().create_calls
    }

    pub fn get_calls(&self) -> u32 {
        self.inner.lock().unwrap().get_calls
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.lock().unwrap().max_in_flight
    }
}

fn body_stream(data: Vec<u8>) -> Vec<Result<Bytes, StorageError>> {
    data.chunks(BODY_CHUNK)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect()
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.objects.get(key).map(|obj| ObjectMetadata {
            size: inner
                .faults
                .head_size_override
                .unwrap_or(obj.data.len() as u64),
            last_modified: Some(obj.last_modified),
            content_type: obj.content_type.clone(),
            etag: None,
            user_metadata: obj.metadata.clone(),
        }))
    }

    async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteChunkStream, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.get_calls += 1;
        let call: u32 = inner.get_calls;

        if call <= inner.faults.fail_get_times {
            return Err(StorageError::transient(
                TransientKind::ServiceUnavailable,
                "injected get failure",
            ));
        }

        let obj: &StoredObject = inner.objects.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;

        let mut data: Vec<u8> = match range {
            Some(r) if r.is_empty() => {
                return Err(StorageError::Backend {
                    code: "InvalidRange".into(),
                    message: format!("unsatisfiable range {} for {}", r.to_http_header(), key),
                });
            }
            Some(r) => {
                let start: usize = (r.start as usize).min(obj.data.len());
                let end: usize = (r.end as usize).min(obj.data.len());
                obj.data[start..end].to_vec()
            }
            None => obj.data.clone(),
        };
        if inner.faults.corrupt_get && !data.is_empty() {
            data[0] ^= 0xff;
        }
        if let Some(limit) = inner.faults.truncate_get {
            data.truncate(limit);
        }

        if call <= inner.faults.fail_get_times + inner.faults.stall_get_times {
            let first: Vec<Result<Bytes, StorageError>> =
                body_stream(data).into_iter().take(1).collect();
            return Ok(stream::iter(first).chain(stream::pending()).boxed());
        }

        Ok(stream::iter(body_stream(data)).boxed())
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let now: DateTime<Utc> = inner.tick();
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                metadata: metadata.clone(),
                content_type: content_type.map(String::from),
                last_modified: now,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.lock().unwrap().objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut listed: Vec<ObjectInfo> = inner
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, obj)| ObjectInfo {
                key: k.clone(),
                size: obj.data.len() as u64,
                last_modified: Some(obj.last_modified),
                etag: None,
            })
            .collect();
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }

    async fn create_multipart(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.create_calls += 1;
        if inner.create_calls <= inner.faults.fail_create {
            return Err(StorageError::transient(
                TransientKind::Throttled,
                "injected create throttle",
            ));
        }
        if inner.faults.empty_upload_id {
            return Ok(String::new());
        }

        inner.next_upload += 1;
        let upload_id: String = format!("upload-{}", inner.next_upload);
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata: metadata.clone(),
                parts: HashMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StorageError> {
        let (delay, stall, fail, fatal): (Option<Duration>, bool, bool, bool) = {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);

            let attempts: u32 = {
                let entry = inner.part_attempts.entry(part_number).or_insert(0);
                *entry += 1;
                *entry
            };
            let fail_limit: u32 = inner
                .faults
                .fail_part_times
                .get(&part_number)
                .copied()
                .unwrap_or(0);

            let delay: Option<Duration> = if inner.faults.reverse_part_delays {
                Some(Duration::from_millis(u64::from(50u32.saturating_sub(part_number)) * 5))
            } else {
                inner.faults.part_delay
            };
            (
                delay,
                inner.faults.stall_parts,
                attempts <= fail_limit,
                inner.faults.fatal_part == Some(part_number),
            )
        };
        let _guard: InFlightGuard = InFlightGuard {
            inner: self.inner.clone(),
        };

        if stall {
            futures::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(StorageError::transient(
                TransientKind::ConnectionReset,
                "injected part reset",
            ));
        }
        if fatal {
            return Err(StorageError::Upload {
                code: "InvalidPart".into(),
                message: format!("injected failure for part {}", part_number),
            });
        }

        let mut inner = self.inner.lock().unwrap();
        let upload: &mut PendingUpload =
            inner
                .uploads
                .get_mut(upload_id)
                .ok_or_else(|| StorageError::Upload {
                    code: "NoSuchUpload".into(),
                    message: upload_id.to_string(),
                })?;
        upload.parts.insert(part_number, data.to_vec());
        Ok(format!("etag-{}-{}", upload_id, part_number))
    }

    async fn complete_multipart(
        &self,
        _key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let upload: PendingUpload =
            inner
                .uploads
                .remove(upload_id)
                .ok_or_else(|| StorageError::Upload {
                    code: "NoSuchUpload".into(),
                    message: upload_id.to_string(),
                })?;

        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StorageError::Upload {
                code: "InvalidPartOrder".into(),
                message: "parts must be ascending".into(),
            });
        }

        let mut data: Vec<u8> = Vec::new();
        for part in parts {
            let bytes: &Vec<u8> =
                upload
                    .parts
                    .get(&part.part_number)
                    .ok_or_else(|| StorageError::Upload {
                        code: "InvalidPart".into(),
                        message: format!("part {} was never uploaded", part.part_number),
                    })?;
            data.extend_from_slice(bytes);
        }

        let now: DateTime<Utc> = inner.tick();
        inner
            .completed
            .push((upload.key.clone(), parts.to_vec()));
        inner.objects.insert(
            upload.key,
            StoredObject {
                data,
                metadata: upload.metadata,
                content_type: None,
                last_modified: now,
            },
        );
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.uploads.remove(upload_id);
        inner.aborted.push(upload_id.to_string());
        Ok(())
    }

    async fn presign(
        &self,
        request: &PresignRequest,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let method: &str = match request {
            PresignRequest::Get { .. } => "GET",
            PresignRequest::Put { .. } => "PUT",
        };
        Ok(format!(
            "https://mock.invalid/{}?method={}&expires={}",
            request.key(),
            method,
            ttl.as_secs()
        ))
    }
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
