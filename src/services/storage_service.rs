//! src/services/storage_service.rs
//!
//! StorageService is the gateway's local object store. Metadata lives in SQLite,
//! payloads live on disk sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`,
//! and access grants are minted by [`GrantSigner`].

use crate::{
    models::{
        bucket::Bucket,
        grant::{UploadCondition, UploadGrant},
        object::Object,
    },
    services::{object_store::ObjectStore, signer::GrantSigner},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("cannot sign access grant: {0}")]
    Signing(String),
    #[error("access grant rejected: {0}")]
    GrantRejected(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Local single-bucket object store.
///
/// Cloning is cheap: the pool is shared and the bucket row is resolved once in
/// [`StorageService::open`].
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    bucket: Bucket,
    signer: GrantSigner,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const DEFAULT_REGION: &str = "local";
/// Name prefix of in-flight writes and overwrite backups in the bucket root.
const SCRATCH_PREFIX: &str = ".tmp-";

impl StorageService {
    /// Open the store for `bucket_name`, creating its row and directory when
    /// missing.
    pub async fn open(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        bucket_name: &str,
        signer: GrantSigner,
    ) -> StorageResult<Self> {
        ensure_bucket_name_safe(bucket_name)?;
        let base_path = base_path.into();

        sqlx::query(
            "INSERT INTO buckets (id, name, region, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(bucket_name)
        .bind(DEFAULT_REGION)
        .bind(Utc::now())
        .execute(&*db)
        .await?;

        let bucket = sqlx::query_as::<_, Bucket>(
            "SELECT id, name, region, created_at FROM buckets WHERE name = ?",
        )
        .bind(bucket_name)
        .fetch_one(&*db)
        .await?;

        let service = Self {
            db,
            base_path,
            bucket,
            signer,
        };
        fs::create_dir_all(service.bucket_root()).await?;
        service.remove_stale_scratch_files().await?;
        debug!(bucket = %service.bucket.name, "object store opened");
        Ok(service)
    }

    /// Delete scratch files left behind by writes that never finished.
    async fn remove_stale_scratch_files(&self) -> StorageResult<()> {
        let mut entries = fs::read_dir(self.bucket_root()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_scratch = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(SCRATCH_PREFIX));
            if !is_scratch || !entry.file_type().await?.is_file() {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => debug!(path = %entry.path().display(), "removed stale scratch file"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
        }
        Ok(())
    }

    /// Fresh scratch path in the bucket root, outside every shard directory.
    fn scratch_path(&self) -> PathBuf {
        self.bucket_root()
            .join(format!("{}{}", SCRATCH_PREFIX, Uuid::new_v4()))
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    pub fn signer(&self) -> &GrantSigner {
        &self.signer
    }

    /// Reject keys that cannot map onto a file path below the bucket.
    ///
    /// Every `/`-separated segment must be non-empty and neither `.` nor `..`,
    /// which also rules out leading, trailing and doubled slashes. Backslashes
    /// and control characters are refused. Dots inside a segment are fine.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Physical base folder of the bucket. Does not check for existence.
    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket.name)
    }

    /// Two-level shard identifiers for an object key.
    ///
    /// Uses MD5(bucket/key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Fully-qualified payload path: base_path/bucket/{shard}/{shard}/{key}.
    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(&self.bucket.name, key);
        let mut path = self.bucket_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn not_found(&self, key: &str) -> StorageError {
        StorageError::ObjectNotFound {
            bucket: self.bucket.name.clone(),
            key: key.to_string(),
        }
    }

    /// Fetch an object's metadata row.
    pub async fn get_object_metadata(&self, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket_id, key, content_type, size_bytes, etag, last_modified
             FROM objects
             WHERE key = ? AND bucket_id = ?",
        )
        .bind(key)
        .bind(self.bucket.id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| self.not_found(key))
    }

    /// Write a payload to disk and upsert its metadata.
    ///
    /// - Writes to a scratch file, fsyncs, then renames into place.
    /// - On overwrite the previous payload is moved aside first and restored
    ///   when the metadata upsert fails, so a surviving row always has its file.
    pub async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<String>,
    ) -> StorageResult<Object> {
        let had_row = match self.get_object_metadata(key).await {
            Ok(_) => true,
            Err(StorageError::ObjectNotFound { .. }) => false,
            Err(err) => return Err(err),
        };

        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = self.scratch_path();
        if let Err(err) = write_synced(&tmp_path, &body).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        let backup = if had_row {
            let backup_path = self.scratch_path();
            match fs::rename(&file_path, &backup_path).await {
                Ok(()) => Some(backup_path),
                Err(err) if err.kind() == ErrorKind::NotFound => None,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            }
        } else {
            None
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            restore_backup(backup.as_deref(), &file_path).await;
            return Err(StorageError::Io(err));
        }

        let etag = format!("{:x}", md5::compute(&body));

        let insert_result = sqlx::query_as::<_, Object>(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, content_type, size_bytes, etag, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING id, bucket_id, key, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(self.bucket.id)
        .bind(key)
        .bind(content_type)
        .bind(body.len() as i64)
        .bind(&etag)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(obj) => {
                if let Some(backup) = backup {
                    let _ = fs::remove_file(&backup).await;
                }
                debug!(key, size = obj.size_bytes, "object stored");
                Ok(obj)
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                restore_backup(backup.as_deref(), &file_path).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    /// Open an object for streaming out.
    ///
    /// Returns ObjectNotFound if metadata exists but the physical file is missing.
    pub async fn get_object_reader(&self, key: &str) -> StorageResult<(Object, File)> {
        let object = self.get_object_metadata(key).await?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                self.not_found(key)
            } else {
                StorageError::Io(err)
            }
        })?;
        Ok((object, file))
    }

    /// Read a whole payload into memory.
    pub async fn read_object(&self, key: &str) -> StorageResult<Bytes> {
        self.get_object_metadata(key).await?;
        match fs::read(self.object_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(self.not_found(key)),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// All keys in the bucket, lexicographically ordered.
    pub async fn list_keys(&self) -> StorageResult<Vec<String>> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM objects WHERE bucket_id = ? ORDER BY key ASC",
        )
        .bind(self.bucket.id)
        .fetch_all(&*self.db)
        .await?;
        Ok(keys)
    }

    /// Remove an object's metadata row and payload.
    ///
    /// Returns ObjectNotFound if no row existed. A payload already missing from
    /// disk is not an error.
    pub async fn delete_object(&self, key: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let result = sqlx::query("DELETE FROM objects WHERE key = ? AND bucket_id = ?")
            .bind(key)
            .bind(self.bucket.id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_found(key));
        }

        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root()).await;
        }
        debug!(key, "object deleted");
        Ok(())
    }

    /// Recursively remove empty directories up to bucket root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        if self.ensure_key_safe(key).is_err() {
            return Ok(false);
        }
        match self.get_object_metadata(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::ObjectNotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.read_object(key).await
    }

    async fn put(&self, key: &str, body: Bytes, content_type: Option<String>) -> StorageResult<()> {
        self.put_object(key, body, content_type).await.map(|_| ())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.delete_object(key).await
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        self.list_keys().await
    }

    fn issue_download_grant(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        self.ensure_key_safe(key)?;
        self.signer.download_url(key, ttl)
    }

    fn issue_upload_grant(
        &self,
        key: &str,
        ttl: Duration,
        conditions: &[UploadCondition],
    ) -> StorageResult<UploadGrant> {
        self.ensure_key_safe(key)?;
        self.signer.upload_grant(key, ttl, conditions)
    }
}

/// Move an overwrite backup back into place. Failure leaves the backup as a
/// scratch file for the next [`StorageService::open`] to sweep.
async fn restore_backup(backup: Option<&Path>, file_path: &Path) {
    if let Some(backup) = backup {
        if let Err(err) = fs::rename(backup, file_path).await {
            tracing::warn!(path = %file_path.display(), error = %err, "could not restore previous payload");
        }
    }
}

async fn write_synced(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(body).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
fn ensure_bucket_name_safe(name: &str) -> StorageResult<()> {
    let invalid = |reason: &str| StorageError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.into(),
    };

    if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
    {
        return Err(invalid(
            "may only contain lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with('.') || name.ends_with('.') || name.starts_with('-') || name.ends_with('-')
    {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
/// Rejects names formatted like `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}
