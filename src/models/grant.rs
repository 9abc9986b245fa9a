//! Time-limited access grants handed out to gallery clients.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default lifetime of any issued grant.
pub const DEFAULT_GRANT_TTL_SECS: u64 = 3600;

/// A browser-style form upload grant: POST `fields` plus a trailing `file`
/// part to `url`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UploadGrant {
    pub url: String,
    pub fields: BTreeMap<String, String>,
}

/// Restrictions baked into an upload grant's signed policy.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UploadCondition {
    /// The form's `Content-Type` field must equal this value.
    ContentType { value: String },
    /// The uploaded file size must fall inside `min..=max` bytes.
    ContentLengthRange { min: u64, max: u64 },
}

/// The signed document carried (base64 encoded) in an upload grant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UploadPolicy {
    /// Unix timestamp after which the policy is rejected.
    pub expiration: i64,
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub conditions: Vec<UploadCondition>,
}
