//! The object-store capability consumed by the gallery router and the
//! thumbnail cache.

use crate::{
    models::grant::{UploadCondition, UploadGrant},
    services::storage_service::StorageResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Key/value blob storage with time-limited access grants.
///
/// `exists` must stay a metadata-only lookup: it runs on every preview request.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Store `body` under `key`, replacing any previous payload.
    async fn put(&self, key: &str, body: Bytes, content_type: Option<String>) -> StorageResult<()>;

    /// Remove `key`. Fails with `ObjectNotFound` when absent.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Every key in the bucket, lexicographically ordered.
    async fn list(&self) -> StorageResult<Vec<String>>;

    fn issue_download_grant(&self, key: &str, ttl: Duration) -> StorageResult<String>;

    fn issue_upload_grant(
        &self,
        key: &str,
        ttl: Duration,
        conditions: &[UploadCondition],
    ) -> StorageResult<UploadGrant>;
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory store with operation counters and failure switches.

    use super::*;
    use crate::services::storage_service::StorageError;
    use std::{
        collections::BTreeMap,
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    #[derive(Default)]
    pub struct MemoryStore {
        objects: Mutex<BTreeMap<String, (Bytes, Option<String>)>>,
        pub puts: AtomicUsize,
        pub gets: AtomicUsize,
        pub fail_grants: AtomicBool,
        pub fail_io: AtomicBool,
    }

    impl MemoryStore {
        pub fn insert(&self, key: &str, body: impl Into<Bytes>) {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (body.into(), None));
        }

        pub fn object(&self, key: &str) -> Option<(Bytes, Option<String>)> {
            self.objects.lock().unwrap().get(key).cloned()
        }

        fn check_io(&self) -> StorageResult<()> {
            if self.fail_io.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::other("backend offline")));
            }
            Ok(())
        }

        fn check_grants(&self) -> StorageResult<()> {
            if self.fail_grants.load(Ordering::SeqCst) {
                return Err(StorageError::Signing("signing disabled".into()));
            }
            Ok(())
        }

        fn not_found(key: &str) -> StorageError {
            StorageError::ObjectNotFound {
                bucket: "memory".into(),
                key: key.to_string(),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn exists(&self, key: &str) -> StorageResult<bool> {
            self.check_io()?;
            Ok(self.objects.lock().unwrap().contains_key(key))
        }

        async fn get(&self, key: &str) -> StorageResult<Bytes> {
            self.check_io()?;
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.object(key)
                .map(|(body, _)| body)
                .ok_or_else(|| Self::not_found(key))
        }

        async fn put(&self, key: &str, body: Bytes, content_type: Option<String>) -> StorageResult<()> {
            self.check_io()?;
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (body, content_type));
            Ok(())
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.check_io()?;
            self.objects
                .lock()
                .unwrap()
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| Self::not_found(key))
        }

        async fn list(&self) -> StorageResult<Vec<String>> {
            self.check_io()?;
            Ok(self.objects.lock().unwrap().keys().cloned().collect())
        }

        fn issue_download_grant(&self, key: &str, ttl: Duration) -> StorageResult<String> {
            self.check_grants()?;
            Ok(format!("memory://{}?ttl={}", key, ttl.as_secs()))
        }

        fn issue_upload_grant(
            &self,
            key: &str,
            ttl: Duration,
            conditions: &[UploadCondition],
        ) -> StorageResult<UploadGrant> {
            self.check_grants()?;
            let mut fields = BTreeMap::new();
            fields.insert("key".to_string(), key.to_string());
            fields.insert("ttl".to_string(), ttl.as_secs().to_string());
            for condition in conditions {
                if let UploadCondition::ContentType { value } = condition {
                    fields.insert("Content-Type".to_string(), value.clone());
                }
            }
            Ok(UploadGrant {
                url: "memory://upload".into(),
                fields,
            })
        }
    }
}
