//! src/services/coordinator.rs
//!
//! Upload coordinator: tracks the lifecycle of chunked uploads and their
//! parts in the ledger, and triggers finalization exactly once when the last
//! part lands. Every write runs in a single ledger transaction that is retried
//! as a whole on transient failures. Ledger and blob store errors are
//! classified into `CoordinatorError` before they leave this module.

use crate::models::{
    part::{CHECKSUM_LEN, Part, PartReport, PartStatus, PartUpdate, UploadedPart},
    upload::{NewUpload, Upload, UploadStatus},
};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    blob_store::{BlobError, BlobStore, ByteStream, MAX_MERGE_FAN_IN, ensure_key_safe},
    finalizer::Finalizer,
    ledger::{Ledger, LedgerError},
    retry::{RetryPolicy, Retryable},
};

/// Largest number of parts a single upload may declare.
pub const MAX_PARTS: i64 = 10_000;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("{0}")]
    Validation(String),
    #[error("upload `{0}` not found")]
    UploadNotFound(Uuid),
    #[error("part {part_number} of upload `{upload_id}` not found")]
    PartNotFound { upload_id: Uuid, part_number: i64 },
    #[error("upload `{0}` already exists")]
    AlreadyExists(Uuid),
    #[error("{0}")]
    ConflictingState(String),
    #[error("finalization failed: {0}")]
    Finalization(String),
    #[error("internal error")]
    Internal,
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

impl CoordinatorError {
    /// Stable identifier for the error class.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::Validation(_) => "validation_error",
            CoordinatorError::UploadNotFound(_) => "upload_not_found",
            CoordinatorError::PartNotFound { .. } => "part_not_found",
            CoordinatorError::AlreadyExists(_) => "already_exists",
            CoordinatorError::ConflictingState(_) => "conflicting_state",
            CoordinatorError::Finalization(_) => "finalization_error",
            CoordinatorError::Internal => "internal_error",
        }
    }

    /// Log the underlying failure and hide it behind `Internal`.
    fn internal(context: &str, err: impl fmt::Display) -> Self {
        error!("{}: {}", context, err);
        CoordinatorError::Internal
    }

    fn validation(msg: impl Into<String>) -> Self {
        CoordinatorError::Validation(msg.into())
    }
}

/// Outcome of one attempt at a ledger transaction.
#[derive(Debug, Error)]
enum TxError {
    #[error(transparent)]
    Rejected(CoordinatorError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<CoordinatorError> for TxError {
    fn from(err: CoordinatorError) -> Self {
        TxError::Rejected(err)
    }
}

impl Retryable for TxError {
    fn is_transient(&self) -> bool {
        match self {
            TxError::Ledger(err) => err.is_transient(),
            TxError::Rejected(_) => false,
        }
    }

    fn deadline_exceeded(after: std::time::Duration) -> Self {
        TxError::Ledger(LedgerError::DeadlineExceeded(after))
    }
}

impl TxError {
    fn classify(self, context: &str) -> CoordinatorError {
        match self {
            TxError::Rejected(err) => err,
            TxError::Ledger(err) => CoordinatorError::internal(context, err),
        }
    }
}

/// What a successful part report leaves behind.
#[derive(Serialize, Debug, Clone)]
pub struct PartReceipt {
    pub part: Part,
    pub upload: Upload,
}

struct ReportOutcome {
    part: Part,
    upload: Upload,
    /// Parts to finalize, present only for the caller that claimed finalization.
    finalize: Option<Vec<Part>>,
}

/// Tunables for a `Coordinator`.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub fan_in: usize,
    pub retry: RetryPolicy,
    /// Final objects are stored at `{final_prefix}/{upload_id}`.
    pub final_prefix: String,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            fan_in: MAX_MERGE_FAN_IN,
            retry: RetryPolicy::default(),
            final_prefix: "objects".into(),
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    ledger: Ledger,
    blobs: Arc<dyn BlobStore>,
    finalizer: Arc<Finalizer>,
    retry: RetryPolicy,
    final_prefix: String,
}

impl Coordinator {
    pub fn new(ledger: Ledger, blobs: Arc<dyn BlobStore>, options: CoordinatorOptions) -> Self {
        let finalizer = Finalizer::new(blobs.clone(), options.retry.clone(), options.fan_in);
        Self {
            ledger,
            blobs,
            finalizer: Arc::new(finalizer),
            retry: options.retry,
            final_prefix: options.final_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Open an upload with `parts_count` pending parts.
    pub async fn create_upload(&self, request: NewUpload) -> CoordinatorResult<Upload> {
        validate_new_upload(&request)?;

        let upload = Upload {
            id: request.id.unwrap_or_else(Uuid::new_v4),
            parts_count: request.parts_count,
            size: request.size,
            mime_type: request.mime_type.trim().to_string(),
            status: UploadStatus::Pending,
            created_at: Utc::now(),
            finalization_claimed: false,
            final_object_key: None,
            completed_at: None,
            failure_reason: None,
        };

        let pending = &upload;
        self.retry
            .run("create upload", move || self.create_once(pending))
            .await
            .map_err(|e| e.classify("create upload"))?;

        info!(
            "created upload {} with {} parts ({} bytes, {})",
            upload.id, upload.parts_count, upload.size, upload.mime_type
        );
        Ok(upload)
    }

    async fn create_once(&self, upload: &Upload) -> Result<(), TxError> {
        let mut tx = self.ledger.begin().await?;
        match Ledger::insert_upload(&mut tx, upload).await {
            Err(LedgerError::AlreadyExists) => {
                return Err(CoordinatorError::AlreadyExists(upload.id).into());
            }
            other => other?,
        }
        Ledger::insert_parts(&mut tx, upload.id, upload.parts_count, upload.created_at).await?;
        tx.commit().await.map_err(LedgerError::from)?;
        Ok(())
    }

    /// Record the outcome of one part and advance the upload's status.
    ///
    /// The caller whose report completes the upload waits for finalization
    /// before this returns. Finalization runs on its own task and carries on
    /// if this call is dropped. A finalization failure fails the upload but is
    /// not an error for the reporter.
    pub async fn report_part(
        &self,
        upload_id: Uuid,
        part_number: i64,
        report: PartReport,
    ) -> CoordinatorResult<PartReceipt> {
        if part_number < 0 {
            return Err(CoordinatorError::validation(format!(
                "part number must be non-negative, got {part_number}"
            )));
        }
        let update = validate_report(report)?;
        if let PartUpdate::Uploaded(meta) = &update {
            self.ensure_part_key_allowed(&meta.object_key)?;
        }

        let change = &update;
        let outcome = self
            .retry
            .run("report part", move || {
                self.report_once(upload_id, part_number, change)
            })
            .await
            .map_err(|e| e.classify("report part"))?;

        debug!(
            "part {} of upload {} is {:?}; upload is {}",
            part_number,
            upload_id,
            outcome.part.status,
            outcome.upload.status.as_str()
        );

        let upload = match outcome.finalize {
            Some(parts) => self.finish_detached(outcome.upload, parts).await,
            None => outcome.upload,
        };
        Ok(PartReceipt {
            part: outcome.part,
            upload,
        })
    }

    async fn report_once(
        &self,
        upload_id: Uuid,
        part_number: i64,
        update: &PartUpdate,
    ) -> Result<ReportOutcome, TxError> {
        let mut tx = self.ledger.begin().await?;
        if !Ledger::lock_upload(&mut tx, upload_id).await? {
            return Err(CoordinatorError::UploadNotFound(upload_id).into());
        }
        let upload = Ledger::fetch_upload(&mut tx, upload_id).await?;

        let part_missing = CoordinatorError::PartNotFound {
            upload_id,
            part_number,
        };
        if part_number >= upload.parts_count {
            return Err(part_missing.into());
        }
        let part = match Ledger::fetch_part(&mut tx, upload_id, part_number).await {
            Err(LedgerError::NotFound) => return Err(part_missing.into()),
            other => other?,
        };

        if let PartUpdate::Uploaded(meta) = update {
            let fits = meta
                .byte_offset
                .checked_add(meta.byte_size)
                .is_some_and(|end| end <= upload.size);
            if !fits {
                return Err(CoordinatorError::validation(format!(
                    "part {part_number} extends past the declared size of {} bytes",
                    upload.size
                ))
                .into());
            }
        }

        if upload.status == UploadStatus::Failed {
            return Err(CoordinatorError::ConflictingState(format!(
                "upload `{upload_id}` has failed and accepts no further reports"
            ))
            .into());
        }

        if let PartUpdate::Uploaded(meta) = update {
            if part.status == PartStatus::Uploaded {
                if part.uploaded_metadata().as_ref() != Some(meta) {
                    return Err(CoordinatorError::ConflictingState(format!(
                        "part {part_number} of upload `{upload_id}` was already reported with different metadata"
                    ))
                    .into());
                }
                debug!(
                    "part {} of upload {} re-reported with identical metadata",
                    part_number, upload_id
                );
                tx.rollback().await.map_err(LedgerError::from)?;
                return Ok(ReportOutcome {
                    part,
                    upload,
                    finalize: None,
                });
            }
        }

        if upload.status == UploadStatus::Completed {
            return Err(CoordinatorError::ConflictingState(format!(
                "upload `{upload_id}` is completed and immutable"
            ))
            .into());
        }

        match update {
            PartUpdate::Uploaded(meta) => {
                Ledger::mark_part_uploaded(&mut tx, upload_id, part_number, meta, Utc::now())
                    .await?
            }
            PartUpdate::Failed => Ledger::mark_part_failed(&mut tx, upload_id, part_number).await?,
        }

        let parts = Ledger::fetch_parts(&mut tx, upload_id).await?;
        let status = UploadStatus::derive(parts.iter().map(|p| p.status));
        if status != upload.status {
            Ledger::set_upload_status(&mut tx, upload_id, status).await?;
        }
        let claimed =
            status == UploadStatus::Completed && Ledger::claim_finalization(&mut tx, upload_id).await?;

        let upload = Ledger::fetch_upload(&mut tx, upload_id).await?;
        let part = parts
            .iter()
            .find(|p| p.part_number == part_number)
            .cloned()
            .ok_or(LedgerError::NotFound)?;
        tx.commit().await.map_err(LedgerError::from)?;

        Ok(ReportOutcome {
            part,
            upload,
            finalize: claimed.then_some(parts),
        })
    }

    /// Run `finish` on a task of its own so that dropping the reporter's
    /// request cannot abandon a claimed finalization halfway.
    async fn finish_detached(&self, upload: Upload, parts: Vec<Part>) -> Upload {
        let upload_id = upload.id;
        let coordinator = self.clone();
        let claimed = upload.clone();
        match tokio::spawn(async move { coordinator.finish(claimed, parts).await }).await {
            Ok(finished) => finished,
            Err(err) => {
                error!("finalization task of upload {} ended abnormally: {}", upload_id, err);
                self.record_outcome(upload_id, Err("finalization_error: finalization task aborted"))
                    .await;
                self.reload_or(upload).await
            }
        }
    }

    /// Assemble the final object and record the result on the upload.
    async fn finish(&self, upload: Upload, parts: Vec<Part>) -> Upload {
        let upload_id = upload.id;
        let final_key = format!("{}/{}", self.final_prefix, upload_id);

        match self.finalizer.finalize(&upload, &parts, &final_key).await {
            Ok(outcome) => {
                info!(
                    "upload {} finalized into {} ({} merges)",
                    upload_id, outcome.final_object_key, outcome.merge_calls
                );
                self.record_outcome(upload_id, Ok(outcome.final_object_key.as_str()))
                    .await;
            }
            Err(err) => {
                error!("finalization of upload {} failed: {}", upload_id, err);
                let reason = format!("finalization_error: {err}");
                self.record_outcome(upload_id, Err(reason.as_str())).await;
            }
        }

        self.reload_or(upload).await
    }

    /// Store how a finalization ended: the final object key, or the reason it failed.
    async fn record_outcome(&self, upload_id: Uuid, outcome: Result<&str, &str>) {
        let recorded = match outcome {
            Ok(key) => {
                self.retry
                    .run("record finalized upload", move || async move {
                        let mut conn = self.ledger.pool().acquire().await.map_err(LedgerError::from)?;
                        Ledger::record_finalized(&mut conn, upload_id, key, Utc::now()).await
                    })
                    .await
            }
            Err(reason) => {
                self.retry
                    .run("record finalization failure", move || async move {
                        let mut conn = self.ledger.pool().acquire().await.map_err(LedgerError::from)?;
                        Ledger::record_finalization_failure(&mut conn, upload_id, reason).await
                    })
                    .await
            }
        };

        match recorded {
            Ok(true) => {}
            Ok(false) => warn!("upload {} was deleted during finalization", upload_id),
            Err(err) => error!("could not record finalization of upload {}: {}", upload_id, err),
        }
    }

    /// Re-read an upload, falling back to `upload` if the ledger cannot answer.
    async fn reload_or(&self, upload: Upload) -> Upload {
        match self.load_upload(upload.id).await {
            Ok(current) => current,
            Err(err) => {
                warn!(
                    "could not re-read upload {} after finalization, returning its claimed state: {}",
                    upload.id, err
                );
                upload
            }
        }
    }

    /// Finish every finalization that was claimed but never recorded, e.g.
    /// because the process stopped mid-merge. Returns how many were resumed.
    ///
    /// Must run before this process accepts reports, since a finalization
    /// claimed in this process looks the same until it records its outcome.
    pub async fn resume_finalizations(&self) -> CoordinatorResult<usize> {
        let stranded = self
            .retry
            .run("list unfinished finalizations", move || async move {
                let mut conn = self.ledger.pool().acquire().await.map_err(LedgerError::from)?;
                Ledger::fetch_unfinished_finalizations(&mut conn).await
            })
            .await
            .map_err(|err| CoordinatorError::internal("list unfinished finalizations", err))?;

        let mut resumed = 0;
        for upload in stranded {
            let upload_id = upload.id;
            let parts = match self.get_upload_parts(upload_id).await {
                Ok(parts) => parts,
                Err(err) => {
                    warn!("skipping finalization of upload {}: {}", upload_id, err);
                    continue;
                }
            };
            info!("resuming interrupted finalization of upload {}", upload_id);
            let finished = self.finish(upload, parts).await;
            debug!("upload {} is {} after resumed finalization", upload_id, finished.status.as_str());
            resumed += 1;
        }
        Ok(resumed)
    }

    pub async fn get_upload(&self, upload_id: Uuid) -> CoordinatorResult<Upload> {
        self.load_upload(upload_id).await
    }

    async fn load_upload(&self, upload_id: Uuid) -> CoordinatorResult<Upload> {
        let result = self
            .retry
            .run("get upload", move || async move {
                let mut conn = self.ledger.pool().acquire().await.map_err(LedgerError::from)?;
                Ledger::fetch_upload(&mut conn, upload_id).await
            })
            .await;
        match result {
            Ok(upload) => Ok(upload),
            Err(LedgerError::NotFound) => Err(CoordinatorError::UploadNotFound(upload_id)),
            Err(err) => Err(CoordinatorError::internal("get upload", err)),
        }
    }

    /// All parts of an upload ordered by part number.
    pub async fn get_upload_parts(&self, upload_id: Uuid) -> CoordinatorResult<Vec<Part>> {
        self.retry
            .run("get upload parts", move || async move {
                let mut tx = self.ledger.begin().await?;
                let parts = Ledger::fetch_parts(&mut tx, upload_id).await?;
                if parts.is_empty() {
                    return Err(CoordinatorError::UploadNotFound(upload_id).into());
                }
                tx.commit().await.map_err(LedgerError::from)?;
                Ok::<_, TxError>(parts)
            })
            .await
            .map_err(|e| e.classify("get upload parts"))
    }

    /// Remove an upload and its parts from the ledger. Blobs are left in place.
    pub async fn delete_upload(&self, upload_id: Uuid) -> CoordinatorResult<()> {
        self.retry
            .run("delete upload", move || async move {
                let mut tx = self.ledger.begin().await?;
                if !Ledger::delete_upload(&mut tx, upload_id).await? {
                    return Err(CoordinatorError::UploadNotFound(upload_id).into());
                }
                tx.commit().await.map_err(LedgerError::from)?;
                Ok::<_, TxError>(())
            })
            .await
            .map_err(|e| e.classify("delete upload"))?;

        info!("deleted upload {}", upload_id);
        Ok(())
    }

    /// Reject part keys that would shadow a final object or a merge intermediate.
    fn ensure_part_key_allowed(&self, key: &str) -> CoordinatorResult<()> {
        let under_final_prefix = key
            .strip_prefix(self.final_prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
        if under_final_prefix || key.contains(".compose/") {
            return Err(CoordinatorError::validation(format!(
                "object_key `{key}` is reserved for assembled objects"
            )));
        }
        Ok(())
    }

    /// Stream the assembled object of a finalized upload.
    pub async fn final_object(&self, upload_id: Uuid) -> CoordinatorResult<(Upload, ByteStream)> {
        let upload = self.load_upload(upload_id).await?;

        let key = match (&upload.status, &upload.final_object_key) {
            (UploadStatus::Failed, _) => {
                return Err(match &upload.failure_reason {
                    Some(reason) => CoordinatorError::Finalization(reason.clone()),
                    None => CoordinatorError::ConflictingState(format!(
                        "upload `{upload_id}` failed before all parts were uploaded"
                    )),
                });
            }
            (_, Some(key)) => key.clone(),
            (status, None) => {
                return Err(CoordinatorError::ConflictingState(format!(
                    "upload `{upload_id}` is {} and has no final object yet",
                    status.as_str()
                )));
            }
        };

        let blobs = &self.blobs;
        let object_key = key.as_str();
        let stream = self
            .retry
            .run("open final object", move || blobs.get_stream(object_key))
            .await
            .map_err(|err| match err {
                BlobError::NotFound(_) => CoordinatorError::ConflictingState(format!(
                    "final object of upload `{upload_id}` no longer exists"
                )),
                other => CoordinatorError::internal("open final object", other),
            })?;
        Ok((upload, stream))
    }

    /// Check that the ledger answers queries.
    pub async fn probe_ledger(&self) -> Result<(), String> {
        self.ledger.ping().await.map_err(|err| err.to_string())
    }

    /// Write, read back and delete a throwaway blob.
    pub async fn probe_blob_store(&self) -> Result<(), String> {
        let key = format!(".readyz/{}", Uuid::new_v4());
        let payload = Bytes::from_static(b"readyz");
        self.blobs
            .put(&key, payload.clone())
            .await
            .map_err(|err| format!("could not write probe blob: {err}"))?;
        let read = self.blobs.get(&key).await;
        if let Err(err) = self.blobs.delete(&key).await {
            warn!("leaked readiness probe blob {}: {}", key, err);
        }
        match read {
            Ok(data) if data == payload => Ok(()),
            Ok(_) => Err("probe blob content mismatch".to_string()),
            Err(err) => Err(format!("could not read probe blob: {err}")),
        }
    }
}

fn validate_new_upload(request: &NewUpload) -> CoordinatorResult<()> {
    if request.parts_count < 1 {
        return Err(CoordinatorError::validation(
            "an upload must declare at least one part",
        ));
    }
    if request.parts_count > MAX_PARTS {
        return Err(CoordinatorError::validation(format!(
            "an upload may declare at most {MAX_PARTS} parts"
        )));
    }
    if request.size < 0 {
        return Err(CoordinatorError::validation("size must be non-negative"));
    }
    if request.mime_type.trim().is_empty() {
        return Err(CoordinatorError::validation("mime_type is required"));
    }
    Ok(())
}

/// Turn a raw report into an update, enforcing all-or-nothing metadata.
fn validate_report(report: PartReport) -> CoordinatorResult<PartUpdate> {
    match report.status.unwrap_or(PartStatus::Uploaded) {
        PartStatus::Pending => {
            return Err(CoordinatorError::validation(
                "a part can only be reported uploaded or failed",
            ));
        }
        PartStatus::Failed => return Ok(PartUpdate::Failed),
        PartStatus::Uploaded => {}
    }

    let (object_key, byte_offset, byte_size, checksum) = match (
        report.object_key,
        report.byte_offset,
        report.byte_size,
        report.checksum,
    ) {
        (Some(key), Some(offset), Some(size), Some(checksum)) => (key, offset, size, checksum),
        _ => {
            return Err(CoordinatorError::validation(
                "an uploaded part requires object_key, byte_offset, byte_size and checksum together",
            ));
        }
    };

    if byte_offset < 0 || byte_size < 0 {
        return Err(CoordinatorError::validation(
            "byte_offset and byte_size must be non-negative",
        ));
    }
    if checksum.len() != CHECKSUM_LEN {
        return Err(CoordinatorError::validation(format!(
            "checksum must be {CHECKSUM_LEN} bytes, got {}",
            checksum.len()
        )));
    }
    ensure_key_safe(&object_key)
        .map_err(|_| CoordinatorError::validation(format!("invalid object_key `{object_key}`")))?;

    Ok(PartUpdate::Uploaded(UploadedPart {
        object_key,
        byte_offset,
        byte_size,
        checksum,
    }))
}
