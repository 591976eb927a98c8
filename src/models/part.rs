//! Represents the numbered parts of an upload and the reports clients send about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Length in bytes of a part checksum (SHA-256 digest).
pub const CHECKSUM_LEN: usize = 32;

/// Lifecycle state of a single part.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PartStatus {
    Pending,
    Uploaded,
    Failed,
}

/// One numbered chunk of an upload.
///
/// `object_key`, `byte_offset`, `byte_size` and `checksum` are always present
/// once the part is `Uploaded`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Part {
    /// Parent upload.
    pub upload_id: Uuid,

    /// Zero-based ordinal, unique per upload.
    pub part_number: i64,

    pub status: PartStatus,

    /// Blob store key holding this part's bytes.
    pub object_key: Option<String>,

    /// Position of this part within the assembled object.
    pub byte_offset: Option<i64>,

    /// Length of this part in bytes.
    pub byte_size: Option<i64>,

    /// SHA-256 of the part's bytes, base64 encoded on the wire.
    #[serde(default, with = "checksum_base64")]
    pub checksum: Option<Vec<u8>>,

    pub created_at: DateTime<Utc>,

    /// When the part was last reported uploaded.
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl Part {
    /// Metadata recorded for an uploaded part, if all of it is present.
    pub fn uploaded_metadata(&self) -> Option<UploadedPart> {
        Some(UploadedPart {
            object_key: self.object_key.clone()?,
            byte_offset: self.byte_offset?,
            byte_size: self.byte_size?,
            checksum: self.checksum.clone()?,
        })
    }
}

/// Location and identity of the bytes of an uploaded part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedPart {
    pub object_key: String,
    pub byte_offset: i64,
    pub byte_size: i64,
    pub checksum: Vec<u8>,
}

/// A validated change to a part's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartUpdate {
    Uploaded(UploadedPart),
    Failed,
}

/// A client's report about one part, as received from the edge.
///
/// Metadata is all-or-nothing: either every field is supplied or none is.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct PartReport {
    pub status: Option<PartStatus>,
    pub object_key: Option<String>,
    pub byte_offset: Option<i64>,
    pub byte_size: Option<i64>,
    #[serde(default, with = "checksum_base64")]
    pub checksum: Option<Vec<u8>>,
}

#[cfg(test)]
impl PartReport {
    /// Report that a part's bytes are in place.
    pub fn uploaded(
        object_key: impl Into<String>,
        byte_offset: i64,
        byte_size: i64,
        checksum: Vec<u8>,
    ) -> Self {
        Self {
            status: Some(PartStatus::Uploaded),
            object_key: Some(object_key.into()),
            byte_offset: Some(byte_offset),
            byte_size: Some(byte_size),
            checksum: Some(checksum),
        }
    }

    /// Report that a part could not be uploaded.
    pub fn failed() -> Self {
        Self {
            status: Some(PartStatus::Failed),
            ..Self::default()
        }
    }
}

mod checksum_base64 {
    use base64::{Engine as _, engine::general_purpose};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| general_purpose::STANDARD.decode(s).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_checksum_decodes_from_base64() {
        let report: PartReport = serde_json::from_str(
            r#"{"status":"uploaded","object_key":"parts/a","byte_offset":0,"byte_size":10,"checksum":"AAECAw=="}"#,
        )
        .unwrap();
        assert_eq!(report.status, Some(PartStatus::Uploaded));
        assert_eq!(report.checksum, Some(vec![0, 1, 2, 3]));
    }

    #[test]
    fn report_without_checksum_is_none() {
        let report: PartReport = serde_json::from_str(r#"{"status":"failed"}"#).unwrap();
        assert_eq!(report.status, Some(PartStatus::Failed));
        assert!(report.checksum.is_none());
        assert!(report.object_key.is_none());
    }

    #[test]
    fn uploaded_metadata_requires_every_field() {
        let mut part = Part {
            upload_id: Uuid::new_v4(),
            part_number: 0,
            status: PartStatus::Uploaded,
            object_key: Some("parts/0".into()),
            byte_offset: Some(0),
            byte_size: Some(5),
            checksum: Some(vec![7; CHECKSUM_LEN]),
            created_at: Utc::now(),
            uploaded_at: Some(Utc::now()),
        };
        assert!(part.uploaded_metadata().is_some());

        part.byte_size = None;
        assert!(part.uploaded_metadata().is_none());
    }
}
