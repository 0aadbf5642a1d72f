//! Represents a registered upload — a logical container for parts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// A logical upload, identified by a client-supplied (sanitized) code and
/// eventually reassembled from its parts in ascending part-code order.
#[derive(Serialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    /// Surrogate key assigned by SQLite. Internal only, never sent to clients.
    #[serde(skip)]
    pub id: i64,

    /// Unique upload code. Restricted to `[A-Za-z0-9-_.]` after sanitizing.
    pub code: String,

    /// Display name used when the reassembled file is downloaded.
    pub filename: String,

    /// When this upload was registered.
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}
