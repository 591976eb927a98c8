//! src/services/blob_store.rs
//!
//! Blob store adapter: the primitive put/get/delete/exists/merge operations the
//! coordinator needs from durable object storage. `FsBlobStore` keeps blobs on
//! local disk sharded beneath `base_path/{shard}/{shard}/{key}`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{self as tokio_io, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use super::retry::Retryable;

/// Largest number of sources a single merge call may combine.
pub const MAX_MERGE_FAN_IN: usize = 32;

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// A boxed stream of blob bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),
    #[error("merge requires between 2 and {max} sources, got {count}")]
    InvalidFanIn { count: usize, max: usize },
    #[error("blob store call exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

impl Retryable for BlobError {
    fn is_transient(&self) -> bool {
        match self {
            BlobError::DeadlineExceeded(_) => true,
            BlobError::Io(err) => matches!(
                err.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::Interrupted
                    | ErrorKind::WouldBlock
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    fn deadline_exceeded(after: Duration) -> Self {
        BlobError::DeadlineExceeded(after)
    }
}

/// Durable object storage as seen by the coordinator.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Store `data` under `key`, replacing any existing blob.
    async fn put(&self, key: &str, data: Bytes) -> BlobResult<()>;

    /// Read a whole blob.
    async fn get(&self, key: &str) -> BlobResult<Bytes>;

    /// Read a blob as a byte stream.
    async fn get_stream(&self, key: &str) -> BlobResult<ByteStream>;

    /// Remove a blob. Missing blobs yield `NotFound`.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    async fn exists(&self, key: &str) -> BlobResult<bool>;

    /// Write the ordered concatenation of `srcs` to `dst`.
    ///
    /// Fails fast unless `2 <= srcs.len() <= max_fan_in()`. Sources are never
    /// reordered and remain in place afterwards.
    async fn merge(&self, dst: &str, srcs: &[String]) -> BlobResult<()>;

    /// The fan-in cap enforced by `merge`.
    fn max_fan_in(&self) -> usize {
        MAX_MERGE_FAN_IN
    }
}

/// Reject merge calls outside `2..=max` sources.
pub fn check_fan_in(count: usize, max: usize) -> BlobResult<()> {
    if count < 2 || count > max {
        return Err(BlobError::InvalidFanIn { count, max });
    }
    Ok(())
}

/// Basic key validation to avoid trivial path traversal vectors.
pub fn ensure_key_safe(key: &str) -> BlobResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.starts_with('/')
        || key.contains("..")
        || key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
    if invalid {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// One piece of a blob being written.
enum Source<'a> {
    Data(Bytes),
    /// The current contents of another blob.
    Blob(&'a str),
}

/// Blob store on the local filesystem.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    /// Base directory on disk where blobs are stored.
    base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Two-level shard identifiers for a key: the first two bytes of MD5(key)
    /// as lowercase hex. Keeps the number of entries per directory small.
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, key: &str) -> BlobResult<PathBuf> {
        ensure_key_safe(key)?;
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        Ok(path)
    }

    fn not_found(key: &str) -> impl FnOnce(io::Error) -> BlobError + '_ {
        move |err| {
            if err.kind() == ErrorKind::NotFound {
                BlobError::NotFound(key.to_string())
            } else {
                BlobError::Io(err)
            }
        }
    }

    /// Stage `sources` in a temp file next to `path`, fsync, then rename it into
    /// place. Blob sources are copied from disk without buffering them whole.
    /// The temp file is removed on any error.
    async fn write_atomically(&self, path: &Path, sources: &[Source<'_>]) -> BlobResult<()> {
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BlobError::Io(io::Error::new(
                ErrorKind::Other,
                "blob path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result: BlobResult<()> = async {
            let mut file = File::create(&tmp_path).await?;
            for source in sources {
                match source {
                    Source::Data(data) => file.write_all(data).await?,
                    Source::Blob(key) => {
                        let src_path = self.blob_path(key)?;
                        let mut src = File::open(&src_path).await.map_err(Self::not_found(key))?;
                        tokio_io::copy(&mut src, &mut file).await?;
                    }
                }
            }
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, path).await?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            self.prune_empty_dirs(&parent).await;
            return Err(err);
        }
        Ok(())
    }

    /// Remove empty shard directories up to (not including) the base path.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> BlobResult<()> {
        let path = self.blob_path(key)?;
        self.write_atomically(&path, &[Source::Data(data)]).await?;
        debug!("stored blob {} at {}", key, path.display());
        Ok(())
    }

    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        let path = self.blob_path(key)?;
        let data = fs::read(&path).await.map_err(Self::not_found(key))?;
        Ok(Bytes::from(data))
    }

    async fn get_stream(&self, key: &str) -> BlobResult<ByteStream> {
        let path = self.blob_path(key)?;
        let file = File::open(&path).await.map_err(Self::not_found(key))?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let path = self.blob_path(key)?;
        fs::remove_file(&path).await.map_err(Self::not_found(key))?;
        debug!("removed blob {}", key);
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        let path = self.blob_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn merge(&self, dst: &str, srcs: &[String]) -> BlobResult<()> {
        check_fan_in(srcs.len(), self.max_fan_in())?;
        let dst_path = self.blob_path(dst)?;

        let sources: Vec<Source<'_>> = srcs.iter().map(|src| Source::Blob(src.as_str())).collect();
        self.write_atomically(&dst_path, &sources).await?;
        debug!("merged {} blobs into {}", srcs.len(), dst);
        Ok(())
    }
}
