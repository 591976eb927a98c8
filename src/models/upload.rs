//! Represents a chunked upload session and its lifecycle state.

use super::part::PartStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of an upload.
///
/// Stored as lowercase snake_case text in the ledger (`pending`, `in_progress`,
/// `completed`, `failed`).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl UploadStatus {
    /// Derive the upload status from the statuses of all of its parts.
    ///
    /// Any failed part fails the upload; all parts uploaded completes it; at
    /// least one uploaded part puts it in progress; otherwise it is pending.
    pub fn derive<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = PartStatus>,
    {
        let mut any_uploaded = false;
        let mut all_uploaded = true;
        let mut seen = 0usize;

        for status in parts {
            seen += 1;
            match status {
                PartStatus::Failed => return UploadStatus::Failed,
                PartStatus::Uploaded => any_uploaded = true,
                PartStatus::Pending => all_uploaded = false,
            }
        }

        if seen > 0 && all_uploaded {
            UploadStatus::Completed
        } else if any_uploaded {
            UploadStatus::InProgress
        } else {
            UploadStatus::Pending
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::InProgress => "in_progress",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }
}

/// A chunked upload: one logical object split into `parts_count` numbered parts.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Upload {
    /// Opaque identifier, client- or server-generated.
    pub id: Uuid,

    /// Number of parts declared at creation.
    pub parts_count: i64,

    /// Total byte size declared at creation.
    pub size: i64,

    /// Content type of the assembled object.
    pub mime_type: String,

    /// Derived from the statuses of the parts.
    pub status: UploadStatus,

    /// When this upload was created.
    pub created_at: DateTime<Utc>,

    /// Set once the transition to Completed has been claimed by a finalizer.
    #[serde(skip)]
    pub finalization_claimed: bool,

    /// Key of the assembled object, present once finalization succeeds.
    pub final_object_key: Option<String>,

    /// When finalization produced the final object.
    pub completed_at: Option<DateTime<Utc>>,

    /// Why the upload failed, when finalization rather than a part failed it.
    pub failure_reason: Option<String>,
}

/// Request to open a new upload. The server picks the id when none is given.
#[derive(Deserialize, Clone, Debug)]
pub struct NewUpload {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub parts_count: i64,
    pub size: i64,
    pub mime_type: String,
}
