//! src/services/ledger.rs
//!
//! Upload ledger: the durable, transactional record of uploads and their parts,
//! kept in SQLite. Every write the coordinator makes goes through a
//! `LedgerTx`; the helpers here take `&mut SqliteConnection` so they can run
//! inside whichever transaction the caller holds.

use crate::models::{
    part::{Part, PartStatus, UploadedPart},
    upload::{Upload, UploadStatus},
};
use chrono::{DateTime, Utc};
use sqlx::{
    QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction,
    error::ErrorKind,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::retry::Retryable;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Rows inserted per statement when creating parts; keeps bind counts well
/// under SQLite's variable limit.
const PART_INSERT_BATCH: usize = 1000;

const UPLOAD_COLUMNS: &str = "id, parts_count, size, mime_type, status, created_at, \
     finalization_claimed, final_object_key, completed_at, failure_reason";

const PART_COLUMNS: &str = "upload_id, part_number, status, object_key, byte_offset, \
     byte_size, checksum, created_at, uploaded_at";

/// Ledger failures, classified from typed driver information.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    AlreadyExists,
    #[error("ledger is busy")]
    Busy,
    #[error("ledger call exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
    #[error(transparent)]
    Database(sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => LedgerError::NotFound,
            sqlx::Error::PoolTimedOut => LedgerError::Busy,
            sqlx::Error::Database(db_err) => {
                if db_err.kind() == ErrorKind::UniqueViolation {
                    LedgerError::AlreadyExists
                } else if is_busy_code(db_err.code().as_deref()) {
                    LedgerError::Busy
                } else {
                    LedgerError::Database(sqlx::Error::Database(db_err))
                }
            }
            other => LedgerError::Database(other),
        }
    }
}

impl Retryable for LedgerError {
    fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Busy | LedgerError::DeadlineExceeded(_))
    }

    fn deadline_exceeded(after: Duration) -> Self {
        LedgerError::DeadlineExceeded(after)
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

/// An open ledger transaction.
pub type LedgerTx = Transaction<'static, Sqlite>;

/// Handle to the ledger database. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Ledger {
    db: Arc<SqlitePool>,
}

impl Ledger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (creating if needed) the SQLite database at `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> LedgerResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Lightweight connectivity probe.
    pub async fn ping(&self) -> LedgerResult<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if one != 1 {
            return Err(LedgerError::Database(sqlx::Error::Protocol(format!(
                "unexpected probe result {one}"
            ))));
        }
        Ok(())
    }

    pub async fn begin(&self) -> LedgerResult<LedgerTx> {
        Ok(self.db.begin().await?)
    }

    pub async fn insert_upload(conn: &mut SqliteConnection, upload: &Upload) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO uploads (id, parts_count, size, mime_type, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(upload.id)
        .bind(upload.parts_count)
        .bind(upload.size)
        .bind(&upload.mime_type)
        .bind(upload.status)
        .bind(upload.created_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Insert parts `0..parts_count`, all pending.
    pub async fn insert_parts(
        conn: &mut SqliteConnection,
        upload_id: Uuid,
        parts_count: i64,
        created_at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let numbers: Vec<i64> = (0..parts_count).collect();
        for batch in numbers.chunks(PART_INSERT_BATCH) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "INSERT INTO parts (upload_id, part_number, status, created_at) ",
            );
            builder.push_values(batch, |mut row, number| {
                row.push_bind(upload_id)
                    .push_bind(*number)
                    .push_bind(PartStatus::Pending)
                    .push_bind(created_at);
            });
            builder.build().execute(&mut *conn).await?;
        }
        Ok(())
    }

    /// Take the write lock on an upload row for the rest of the transaction.
    ///
    /// Returns `false` when the upload does not exist.
    pub async fn lock_upload(conn: &mut SqliteConnection, upload_id: Uuid) -> LedgerResult<bool> {
        let result = sqlx::query("UPDATE uploads SET status = status WHERE id = ?")
            .bind(upload_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn fetch_upload(conn: &mut SqliteConnection, upload_id: Uuid) -> LedgerResult<Upload> {
        let sql = format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = ?");
        Ok(sqlx::query_as::<_, Upload>(&sql)
            .bind(upload_id)
            .fetch_one(&mut *conn)
            .await?)
    }

    /// All parts of an upload ordered by part number.
    pub async fn fetch_parts(conn: &mut SqliteConnection, upload_id: Uuid) -> LedgerResult<Vec<Part>> {
        let sql = format!(
            "SELECT {PART_COLUMNS} FROM parts WHERE upload_id = ? ORDER BY part_number ASC"
        );
        Ok(sqlx::query_as::<_, Part>(&sql)
            .bind(upload_id)
            .fetch_all(&mut *conn)
            .await?)
    }

    pub async fn fetch_part(
        conn: &mut SqliteConnection,
        upload_id: Uuid,
        part_number: i64,
    ) -> LedgerResult<Part> {
        let sql = format!("SELECT {PART_COLUMNS} FROM parts WHERE upload_id = ? AND part_number = ?");
        Ok(sqlx::query_as::<_, Part>(&sql)
            .bind(upload_id)
            .bind(part_number)
            .fetch_one(&mut *conn)
            .await?)
    }

    pub async fn mark_part_uploaded(
        conn: &mut SqliteConnection,
        upload_id: Uuid,
        part_number: i64,
        uploaded: &UploadedPart,
        uploaded_at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE parts
             SET status = 'uploaded', object_key = ?, byte_offset = ?, byte_size = ?,
                 checksum = ?, uploaded_at = ?
             WHERE upload_id = ? AND part_number = ?",
        )
        .bind(&uploaded.object_key)
        .bind(uploaded.byte_offset)
        .bind(uploaded.byte_size)
        .bind(&uploaded.checksum)
        .bind(uploaded_at)
        .bind(upload_id)
        .bind(part_number)
        .execute(&mut *conn)
        .await?;
        expect_one_row(result.rows_affected())
    }

    pub async fn mark_part_failed(
        conn: &mut SqliteConnection,
        upload_id: Uuid,
        part_number: i64,
    ) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE parts SET status = 'failed' WHERE upload_id = ? AND part_number = ?",
        )
        .bind(upload_id)
        .bind(part_number)
        .execute(&mut *conn)
        .await?;
        expect_one_row(result.rows_affected())
    }

    pub async fn set_upload_status(
        conn: &mut SqliteConnection,
        upload_id: Uuid,
        status: UploadStatus,
    ) -> LedgerResult<()> {
        let result = sqlx::query("UPDATE uploads SET status = ? WHERE id = ?")
            .bind(status)
            .bind(upload_id)
            .execute(&mut *conn)
            .await?;
        expect_one_row(result.rows_affected())
    }

    /// Claim the right to finalize an upload. Only the first caller gets `true`.
    pub async fn claim_finalization(
        conn: &mut SqliteConnection,
        upload_id: Uuid,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE uploads SET finalization_claimed = 1
             WHERE id = ? AND finalization_claimed = 0",
        )
        .bind(upload_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Completed uploads whose claimed finalization never recorded an outcome,
    /// oldest first.
    pub async fn fetch_unfinished_finalizations(
        conn: &mut SqliteConnection,
    ) -> LedgerResult<Vec<Upload>> {
        let sql = format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads
             WHERE status = 'completed' AND finalization_claimed = 1
               AND final_object_key IS NULL
             ORDER BY created_at ASC"
        );
        Ok(sqlx::query_as::<_, Upload>(&sql).fetch_all(&mut *conn).await?)
    }

    /// Record the final object of a completed upload. `false` if the upload is gone.
    pub async fn record_finalized(
        conn: &mut SqliteConnection,
        upload_id: Uuid,
        final_object_key: &str,
        completed_at: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE uploads SET final_object_key = ?, completed_at = ?
             WHERE id = ? AND status = 'completed'",
        )
        .bind(final_object_key)
        .bind(completed_at)
        .bind(upload_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Fail an upload whose finalization could not complete. `false` if the upload is gone.
    pub async fn record_finalization_failure(
        conn: &mut SqliteConnection,
        upload_id: Uuid,
        reason: &str,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE uploads SET status = 'failed', failure_reason = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(upload_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Remove an upload and all of its parts. `false` if there was no such upload.
    pub async fn delete_upload(conn: &mut SqliteConnection, upload_id: Uuid) -> LedgerResult<bool> {
        sqlx::query("DELETE FROM parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *conn)
            .await?;
        let result = sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(upload_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn expect_one_row(rows_affected: u64) -> LedgerResult<()> {
    if rows_affected == 0 {
        return Err(LedgerError::NotFound);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::part::CHECKSUM_LEN;
    use crate::services::test_support::memory_ledger;

    fn upload(parts_count: i64) -> Upload {
        Upload {
            id: Uuid::new_v4(),
            parts_count,
            size: parts_count * 10,
            mime_type: "application/octet-stream".into(),
            status: UploadStatus::Pending,
            created_at: Utc::now(),
            finalization_claimed: false,
            final_object_key: None,
            completed_at: None,
            failure_reason: None,
        }
    }

    async fn create(ledger: &Ledger, upload: &Upload) {
        let mut tx = ledger.begin().await.unwrap();
        Ledger::insert_upload(&mut tx, upload).await.unwrap();
        Ledger::insert_parts(&mut tx, upload.id, upload.parts_count, upload.created_at)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn inserted_upload_reads_back_with_pending_parts() {
        let ledger = memory_ledger().await;
        let up = upload(3);
        create(&ledger, &up).await;

        let mut conn = ledger.pool().acquire().await.unwrap();
        let stored = Ledger::fetch_upload(&mut conn, up.id).await.unwrap();
        assert_eq!(stored.id, up.id);
        assert_eq!(stored.status, UploadStatus::Pending);
        assert!(!stored.finalization_claimed);

        let parts = Ledger::fetch_parts(&mut conn, up.id).await.unwrap();
        let numbers: Vec<i64> = parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
        assert!(parts.iter().all(|p| p.status == PartStatus::Pending));
    }

    #[tokio::test]
    async fn large_part_counts_are_batched() {
        let ledger = memory_ledger().await;
        let up = upload(2500);
        create(&ledger, &up).await;

        let mut conn = ledger.pool().acquire().await.unwrap();
        let parts = Ledger::fetch_parts(&mut conn, up.id).await.unwrap();
        assert_eq!(parts.len(), 2500);
        assert_eq!(parts.last().unwrap().part_number, 2499);
    }

    #[tokio::test]
    async fn duplicate_upload_is_already_exists() {
        let ledger = memory_ledger().await;
        let up = upload(1);
        create(&ledger, &up).await;

        let mut tx = ledger.begin().await.unwrap();
        let err = Ledger::insert_upload(&mut tx, &up).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists));
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        let ledger = memory_ledger().await;
        let mut conn = ledger.pool().acquire().await.unwrap();
        let id = Uuid::new_v4();
        assert!(matches!(
            Ledger::fetch_upload(&mut conn, id).await,
            Err(LedgerError::NotFound)
        ));
        assert!(matches!(
            Ledger::fetch_part(&mut conn, id, 0).await,
            Err(LedgerError::NotFound)
        ));
        assert!(!Ledger::lock_upload(&mut conn, id).await.unwrap());
        assert!(matches!(
            Ledger::mark_part_failed(&mut conn, id, 0).await,
            Err(LedgerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn uploaded_part_metadata_round_trips() {
        let ledger = memory_ledger().await;
        let up = upload(2);
        create(&ledger, &up).await;

        let meta = UploadedPart {
            object_key: "parts/1".into(),
            byte_offset: 10,
            byte_size: 10,
            checksum: vec![9; CHECKSUM_LEN],
        };
        let mut conn = ledger.pool().acquire().await.unwrap();
        Ledger::mark_part_uploaded(&mut conn, up.id, 1, &meta, Utc::now())
            .await
            .unwrap();

        let part = Ledger::fetch_part(&mut conn, up.id, 1).await.unwrap();
        assert_eq!(part.status, PartStatus::Uploaded);
        assert_eq!(part.uploaded_metadata(), Some(meta));
        assert!(part.uploaded_at.is_some());
    }

    #[tokio::test]
    async fn finalization_can_only_be_claimed_once() {
        let ledger = memory_ledger().await;
        let up = upload(1);
        create(&ledger, &up).await;

        let mut conn = ledger.pool().acquire().await.unwrap();
        assert!(Ledger::claim_finalization(&mut conn, up.id).await.unwrap());
        assert!(!Ledger::claim_finalization(&mut conn, up.id).await.unwrap());
    }

    #[tokio::test]
    async fn unfinished_finalizations_are_claimed_completed_uploads_without_a_key() {
        let ledger = memory_ledger().await;
        let (stranded, finished, open) = (upload(1), upload(1), upload(1));
        for up in [&stranded, &finished, &open] {
            create(&ledger, up).await;
        }

        let mut conn = ledger.pool().acquire().await.unwrap();
        for up in [&stranded, &finished] {
            Ledger::set_upload_status(&mut conn, up.id, UploadStatus::Completed)
                .await
                .unwrap();
            assert!(Ledger::claim_finalization(&mut conn, up.id).await.unwrap());
        }
        assert!(
            Ledger::record_finalized(&mut conn, finished.id, "objects/done", Utc::now())
                .await
                .unwrap()
        );

        let found = Ledger::fetch_unfinished_finalizations(&mut conn).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![stranded.id]);
    }

    #[tokio::test]
    async fn rolled_back_transaction_leaves_no_rows() {
        let ledger = memory_ledger().await;
        let up = upload(4);
        {
            let mut tx = ledger.begin().await.unwrap();
            Ledger::insert_upload(&mut tx, &up).await.unwrap();
            Ledger::insert_parts(&mut tx, up.id, up.parts_count, up.created_at)
                .await
                .unwrap();
            tx.rollback().await.unwrap();
        }

        let mut conn = ledger.pool().acquire().await.unwrap();
        assert!(matches!(
            Ledger::fetch_upload(&mut conn, up.id).await,
            Err(LedgerError::NotFound)
        ));
        assert!(Ledger::fetch_parts(&mut conn, up.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_upload_and_parts() {
        let ledger = memory_ledger().await;
        let up = upload(2);
        create(&ledger, &up).await;

        let mut conn = ledger.pool().acquire().await.unwrap();
        assert!(Ledger::delete_upload(&mut conn, up.id).await.unwrap());
        assert!(Ledger::fetch_parts(&mut conn, up.id).await.unwrap().is_empty());
        assert!(!Ledger::delete_upload(&mut conn, up.id).await.unwrap());
    }

    #[test]
    fn busy_codes_cover_extended_variants() {
        assert!(is_busy_code(Some("5")));
        assert!(is_busy_code(Some("517")));
        assert!(is_busy_code(Some("6")));
        assert!(!is_busy_code(Some("19")));
        assert!(!is_busy_code(Some("2067")));
        assert!(!is_busy_code(None));
    }

    #[test]
    fn only_busy_and_deadline_are_transient() {
        assert!(LedgerError::Busy.is_transient());
        assert!(LedgerError::deadline_exceeded(Duration::from_secs(1)).is_transient());
        assert!(!LedgerError::NotFound.is_transient());
        assert!(!LedgerError::AlreadyExists.is_transient());
    }
}
