//! Object storage backends for project archives and their index records.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{FlashError, Result};

/// Minimal key/value object store: last write wins, no versioning.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;
    /// `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Every key starting with `prefix`, in lexical order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local store used by tests and `--storage memory` runs.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.objects
            .lock()
            .map_err(|_| FlashError::storage("lock", "memory store poisoned"))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        self.objects()?.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects()?.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects()?.remove(key);
        Ok(())
    }
}

#[cfg(feature = "s3")]
pub use s3::S3Store;

#[cfg(feature = "s3")]
mod s3 {
    use super::ObjectStore;
    use crate::error::{FlashError, Result};
    use async_trait::async_trait;
    use aws_sdk_s3::Client;
    use aws_sdk_s3::config::Region;
    use aws_sdk_s3::error::DisplayErrorContext;
    use aws_sdk_s3::primitives::ByteStream;
    use log::debug;

    /// S3 bucket backend. Credentials come from the default AWS provider chain.
    pub struct S3Store {
        client: Client,
        bucket: String,
    }

    impl S3Store {
        pub async fn connect(region: &str, bucket: &str) -> Self {
            let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new(region.to_string()))
                .load()
                .await;
            S3Store {
                client: Client::new(&config),
                bucket: bucket.to_string(),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for S3Store {
        async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
            debug!("s3 put {}/{} ({} bytes)", self.bucket, key, bytes.len());
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type(content_type)
                .body(ByteStream::from(bytes))
                .send()
                .await
                .map_err(|e| FlashError::storage("put", DisplayErrorContext(&e)))?;
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let output = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                        return Ok(None);
                    }
                    return Err(FlashError::storage("get", DisplayErrorContext(&e)));
                }
            };
            let data = output
                .body
                .collect()
                .await
                .map_err(|e| FlashError::storage("get", e))?;
            Ok(Some(data.into_bytes().to_vec()))
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            let mut keys = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let output = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(prefix)
                    .set_continuation_token(token.take())
                    .send()
                    .await
                    .map_err(|e| FlashError::storage("list", DisplayErrorContext(&e)))?;

                keys.extend(
                    output
                        .contents()
                        .iter()
                        .filter_map(|obj| obj.key().map(str::to_string)),
                );

                match output.next_continuation_token() {
                    Some(next) if output.is_truncated().unwrap_or(false) => {
                        token = Some(next.to_string())
                    }
                    _ => break,
                }
            }
            Ok(keys)
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| FlashError::storage("delete", DisplayErrorContext(&e)))?;
            Ok(())
        }
    }
}
