//! Represents one named chunk of an upload's bytes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// A single part belonging to exactly one upload, unique by
/// `(upload_id, part_code)`. The struct stores metadata only; the bytes live
/// on disk under the part store.
#[derive(Serialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Surrogate key assigned by SQLite. Internal only, never sent to clients.
    #[serde(skip)]
    pub id: i64,

    /// Owning upload's surrogate key.
    pub upload_id: i64,

    /// Part code, unique within the owning upload. Sanitized like the
    /// upload code; its lexicographic order determines reassembly order.
    pub part_code: String,

    /// When the part's bytes were last written.
    pub created_at: DateTime<Utc>,
}
