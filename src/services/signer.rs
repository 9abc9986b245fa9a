//! HMAC-SHA256 signing for download URLs and upload policies.
//!
//! Download URL: `{public_url}/_store/{key}?expires={unix}&signature={hex}` where
//! the signature covers `GET\n{bucket}\n{key}\n{expires}`.
//!
//! Upload grant: form fields carrying a base64 JSON [`UploadPolicy`] and the hex
//! signature of that base64 string.

use crate::models::grant::{UploadCondition, UploadGrant, UploadPolicy};
use crate::services::storage_service::{StorageError, StorageResult};
use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{collections::BTreeMap, time::Duration};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Path segment under which grant redemption endpoints are mounted.
pub const STORE_PREFIX: &str = "_store";

pub const FIELD_KEY: &str = "key";
pub const FIELD_POLICY: &str = "policy";
pub const FIELD_SIGNATURE: &str = "signature";
pub const FIELD_CONTENT_TYPE: &str = "Content-Type";

#[derive(Clone)]
pub struct GrantSigner {
    secret: Vec<u8>,
    public_url: Url,
    bucket: String,
}

impl GrantSigner {
    pub fn new(secret: impl AsRef<[u8]>, public_url: &str, bucket: impl Into<String>) -> StorageResult<Self> {
        let public_url = Url::parse(public_url)
            .map_err(|e| StorageError::Signing(format!("invalid public url `{}`: {}", public_url, e)))?;
        if public_url.cannot_be_a_base() {
            return Err(StorageError::Signing(format!(
                "public url `{}` cannot carry a path",
                public_url
            )));
        }

        Ok(Self {
            secret: secret.as_ref().to_vec(),
            public_url,
            bucket: bucket.into(),
        })
    }

    /// Sign a GET for `key` valid for `ttl`.
    pub fn download_url(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        let expires = Utc::now().timestamp() + ttl_secs(ttl);
        let signature = self.sign(&self.download_payload(key, expires))?;

        let mut url = self.store_url()?;
        url.path_segments_mut()
            .map_err(|_| StorageError::Signing("public url cannot carry a path".into()))?
            .extend(key.split('/'));
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair(FIELD_SIGNATURE, &signature);

        Ok(url.to_string())
    }

    /// Check a redeemed download grant.
    pub fn verify_download(&self, key: &str, expires: i64, signature: &str) -> StorageResult<()> {
        self.verify_download_at(key, expires, signature, Utc::now().timestamp())
    }

    fn verify_download_at(&self, key: &str, expires: i64, signature: &str, now: i64) -> StorageResult<()> {
        if now > expires {
            return Err(StorageError::GrantRejected("Access grant expired".into()));
        }
        self.verify(&self.download_payload(key, expires), signature)
    }

    /// Build an upload grant for `key` whose policy embeds `conditions`.
    pub fn upload_grant(
        &self,
        key: &str,
        ttl: Duration,
        conditions: &[UploadCondition],
    ) -> StorageResult<UploadGrant> {
        let policy = UploadPolicy {
            expiration: Utc::now().timestamp() + ttl_secs(ttl),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            conditions: conditions.to_vec(),
        };
        let encoded = serde_json::to_vec(&policy)
            .map(|json| general_purpose::STANDARD.encode(json))
            .map_err(|e| StorageError::Signing(format!("cannot encode policy: {}", e)))?;
        let signature = self.sign(&encoded)?;

        let mut fields = BTreeMap::new();
        fields.insert(FIELD_KEY.to_string(), key.to_string());
        fields.insert(FIELD_POLICY.to_string(), encoded);
        fields.insert(FIELD_SIGNATURE.to_string(), signature);
        for condition in conditions {
            if let UploadCondition::ContentType { value } = condition {
                fields.insert(FIELD_CONTENT_TYPE.to_string(), value.clone());
            }
        }

        Ok(UploadGrant {
            url: self.store_url()?.to_string(),
            fields,
        })
    }

    /// Verify an upload policy's signature and expiry and decode it.
    pub fn verify_upload(&self, encoded_policy: &str, signature: &str) -> StorageResult<UploadPolicy> {
        self.verify_upload_at(encoded_policy, signature, Utc::now().timestamp())
    }

    fn verify_upload_at(&self, encoded_policy: &str, signature: &str, now: i64) -> StorageResult<UploadPolicy> {
        self.verify(encoded_policy, signature)?;

        let policy: UploadPolicy = general_purpose::STANDARD
            .decode(encoded_policy)
            .ok()
            .and_then(|json| serde_json::from_slice(&json).ok())
            .ok_or_else(|| StorageError::GrantRejected("Malformed upload policy".into()))?;

        if now > policy.expiration {
            return Err(StorageError::GrantRejected("Upload policy expired".into()));
        }
        if policy.bucket != self.bucket {
            return Err(StorageError::GrantRejected("Upload policy targets another bucket".into()));
        }
        Ok(policy)
    }

    fn store_url(&self) -> StorageResult<Url> {
        let mut url = self.public_url.clone();
        url.path_segments_mut()
            .map_err(|_| StorageError::Signing("public url cannot carry a path".into()))?
            .pop_if_empty()
            .push(STORE_PREFIX);
        Ok(url)
    }

    fn download_payload(&self, key: &str, expires: i64) -> String {
        format!("GET\n{}\n{}\n{}", self.bucket, key, expires)
    }

    fn mac(&self) -> StorageResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| StorageError::Signing(format!("HMAC error: {}", e)))
    }

    fn sign(&self, payload: &str) -> StorageResult<String> {
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, payload: &str, signature: &str) -> StorageResult<()> {
        let provided = hex::decode(signature)
            .map_err(|_| StorageError::GrantRejected("Invalid signature".into()))?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| StorageError::GrantRejected("Invalid signature".into()))
    }
}

/// Check a decoded policy against what the client actually submitted.
pub fn enforce_policy(
    policy: &UploadPolicy,
    form_key: &str,
    content_type: Option<&str>,
    size: u64,
) -> StorageResult<()> {
    if policy.key != form_key {
        return Err(StorageError::GrantRejected("Key does not match upload policy".into()));
    }
    for condition in &policy.conditions {
        match condition {
            UploadCondition::ContentType { value } => {
                if content_type != Some(value.as_str()) {
                    return Err(StorageError::GrantRejected(
                        "Content-Type does not match upload policy".into(),
                    ));
                }
            }
            UploadCondition::ContentLengthRange { min, max } => {
                if size < *min || size > *max {
                    return Err(StorageError::GrantRejected(
                        "File size outside the allowed range".into(),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2)
}
