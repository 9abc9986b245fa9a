//! Represents the bucket that holds every gallery object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The storage bucket configured for this gateway.
///
/// A gateway process serves exactly one bucket; the row is created on startup
/// when missing and never removed by the gateway itself.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket (UUID for internal DB use).
    pub id: Uuid,

    /// Bucket name (must conform to DNS naming rules).
    pub name: String,

    /// Region label recorded for the bucket (e.g. "local").
    pub region: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}
