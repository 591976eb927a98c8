//! Shared fixtures for service tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    collections::{HashMap, HashSet},
    io::{self, ErrorKind},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use super::{
    blob_store::{BlobError, BlobResult, BlobStore, ByteStream, MAX_MERGE_FAN_IN, check_fan_in},
    ledger::Ledger,
    retry::RetryPolicy,
};

/// A migrated ledger backed by a private in-memory database.
///
/// The pool holds exactly one connection that never expires, since every
/// connection to `sqlite::memory:` opens a different database.
pub async fn memory_ledger() -> Ledger {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    let ledger = Ledger::new(Arc::new(pool));
    ledger.migrate().await.expect("migrate in-memory ledger");
    ledger
}

/// Retry policy with millisecond backoffs.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        call_timeout: Duration::from_secs(5),
    }
}

/// In-memory blob store that records every merge call.
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
    merges: Mutex<Vec<(String, Vec<String>)>>,
    fan_in: usize,
    transient_merge_failures: AtomicU32,
    failing_destinations: Mutex<HashSet<String>>,
    merge_delay: Mutex<Option<Duration>>,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::with_fan_in(MAX_MERGE_FAN_IN)
    }
}

impl MemoryBlobStore {
    pub fn with_fan_in(fan_in: usize) -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            merges: Mutex::new(Vec::new()),
            fan_in,
            transient_merge_failures: AtomicU32::new(0),
            failing_destinations: Mutex::new(HashSet::new()),
            merge_delay: Mutex::new(None),
        }
    }

    /// Every merge call that reached the store, in arrival order.
    pub fn merge_calls(&self) -> Vec<(String, Vec<String>)> {
        self.merges.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }

    /// Make the next `n` merges fail with a timeout.
    pub fn fail_next_merges(&self, n: u32) {
        self.transient_merge_failures.store(n, Ordering::SeqCst);
    }

    /// Make every merge into `dst` time out.
    pub fn fail_merges_into(&self, dst: &str) {
        self.failing_destinations
            .lock()
            .unwrap()
            .insert(dst.to_string());
    }

    /// Make every merge take at least `delay` before it lands.
    pub fn delay_merges(&self, delay: Duration) {
        *self.merge_delay.lock().unwrap() = Some(delay);
    }

    fn lookup(&self, key: &str) -> BlobResult<Bytes> {
        self.blobs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }
}

fn timed_out() -> BlobError {
    BlobError::Io(io::Error::new(ErrorKind::TimedOut, "injected merge timeout"))
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> BlobResult<()> {
        self.blobs.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        self.lookup(key)
    }

    async fn get_stream(&self, key: &str) -> BlobResult<ByteStream> {
        let data = self.lookup(key)?;
        Ok(Box::pin(stream::iter([Ok(data)])))
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.blobs
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        Ok(self.blobs.lock().unwrap().contains_key(key))
    }

    async fn merge(&self, dst: &str, srcs: &[String]) -> BlobResult<()> {
        check_fan_in(srcs.len(), self.fan_in)?;
        self.merges
            .lock()
            .unwrap()
            .push((dst.to_string(), srcs.to_vec()));

        let delay = *self.merge_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing_destinations.lock().unwrap().contains(dst) {
            return Err(timed_out());
        }
        let injected = self
            .transient_merge_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(timed_out());
        }

        let mut blobs = self.blobs.lock().unwrap();
        let mut merged = Vec::new();
        for src in srcs {
            let data = blobs
                .get(src)
                .ok_or_else(|| BlobError::NotFound(src.clone()))?;
            merged.extend_from_slice(data);
        }
        blobs.insert(dst.to_string(), Bytes::from(merged));
        Ok(())
    }

    fn max_fan_in(&self) -> usize {
        self.fan_in
    }
}
