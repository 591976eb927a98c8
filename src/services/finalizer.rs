//! src/services/finalizer.rs
//!
//! Reduces the part blobs of a fully uploaded upload into one final blob
//! using a merge primitive that accepts at most `fan_in` sources per call.
//!
//! Planning is pure: `plan_reduction` turns the ordered part keys into levels
//! of merge calls. The bottom level merges just enough leading parts (all full
//! groups but the last) to leave exactly `fan_in^(depth-1)` keys, so every
//! upper level is a complete `fan_in`-ary merge. That gives the minimum number
//! of merge calls, `ceil((n-1)/(fan_in-1))`, at depth `ceil(log_fan_in(n))`.
//!
//! Execution runs one level at a time. Calls within a level are independent
//! and issued concurrently; each is retried under the configured policy.
//! Intermediate blobs are removed as soon as the level consuming them is done.

use crate::models::{
    part::{Part, PartStatus},
    upload::Upload,
};
use futures::future::join_all;
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{
    blob_store::{BlobError, BlobStore, MAX_MERGE_FAN_IN},
    retry::RetryPolicy,
};

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("fan-in must be between 2 and {MAX_MERGE_FAN_IN}, got {0}")]
    InvalidFanIn(usize),
    #[error("nothing to finalize: upload has no parts")]
    NoParts,
    #[error("part layout is inconsistent: {0}")]
    Layout(String),
    #[error("merge into `{dst}` failed: {source}")]
    Merge {
        dst: String,
        #[source]
        source: BlobError,
    },
}

pub type FinalizeResult<T> = Result<T, FinalizeError>;

/// One call to the merge primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCall {
    pub dst: String,
    pub srcs: Vec<String>,
}

/// Levels of merge calls reducing the part keys to `final_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionPlan {
    pub levels: Vec<Vec<MergeCall>>,
    /// Key of the assembled object. For a single part this is the part's own key.
    pub final_key: String,
}

impl ReductionPlan {
    pub fn merge_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// True when the only part is used as the final object without merging.
    pub fn is_alias(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Minimum number of merge calls needed for `parts` keys at the given fan-in.
pub fn merge_call_bound(parts: usize, fan_in: usize) -> usize {
    parts.saturating_sub(1).div_ceil(fan_in.saturating_sub(1).max(1))
}

/// Smallest `d` with `fan_in^d >= parts`, returned with `fan_in^(d-1)`.
fn depth_and_upper_width(parts: usize, fan_in: usize) -> (usize, usize) {
    let mut depth = 0;
    let mut capacity = 1usize;
    while capacity < parts {
        capacity = capacity.saturating_mul(fan_in);
        depth += 1;
    }
    (depth, capacity / fan_in)
}

/// Plan the merges turning `part_keys` (already in part order) into one blob.
pub fn plan_reduction(
    part_keys: &[String],
    fan_in: usize,
    final_key: &str,
    scratch_prefix: &str,
) -> FinalizeResult<ReductionPlan> {
    if !(2..=MAX_MERGE_FAN_IN).contains(&fan_in) {
        return Err(FinalizeError::InvalidFanIn(fan_in));
    }
    match part_keys {
        [] => return Err(FinalizeError::NoParts),
        [only] => {
            return Ok(ReductionPlan {
                levels: Vec::new(),
                final_key: only.clone(),
            });
        }
        _ => {}
    }

    let (_, upper_width) = depth_and_upper_width(part_keys.len(), fan_in);

    // Bottom level: full groups, then one partial group, then promoted keys.
    let mut remaining = part_keys.len() - upper_width;
    let mut sizes = Vec::new();
    while remaining > 0 {
        let size = remaining.min(fan_in - 1) + 1;
        remaining -= size - 1;
        sizes.push(size);
    }
    let merged: usize = sizes.iter().sum();
    sizes.extend(std::iter::repeat_n(1, part_keys.len() - merged));

    let mut levels = Vec::new();
    let mut current = part_keys.to_vec();
    loop {
        let (calls, next) = build_level(&current, &sizes, levels.len(), final_key, scratch_prefix);
        levels.push(calls);
        current = next;
        if current.len() == 1 {
            break;
        }
        sizes = current
            .chunks(fan_in)
            .map(<[String]>::len)
            .collect();
    }

    Ok(ReductionPlan {
        levels,
        final_key: final_key.to_string(),
    })
}

/// Split `keys` into consecutive groups of `sizes`; groups of one are promoted.
fn build_level(
    keys: &[String],
    sizes: &[usize],
    level: usize,
    final_key: &str,
    scratch_prefix: &str,
) -> (Vec<MergeCall>, Vec<String>) {
    let is_last = sizes.len() == 1;
    let mut calls = Vec::new();
    let mut next = Vec::with_capacity(sizes.len());
    let mut cursor = 0;

    for (index, &size) in sizes.iter().enumerate() {
        let group = &keys[cursor..cursor + size];
        cursor += size;
        if size == 1 {
            next.push(group[0].clone());
            continue;
        }
        let dst = if is_last {
            final_key.to_string()
        } else {
            format!("{scratch_prefix}/l{level}-{index}")
        };
        next.push(dst.clone());
        calls.push(MergeCall {
            dst,
            srcs: group.to_vec(),
        });
    }
    (calls, next)
}

/// Part object keys in part order, after checking that the parts tile
/// `[0, upload.size)` without gaps or overlaps.
pub fn ordered_part_keys(upload: &Upload, parts: &[Part]) -> FinalizeResult<Vec<String>> {
    if parts.is_empty() {
        return Err(FinalizeError::NoParts);
    }
    if parts.len() as i64 != upload.parts_count {
        return Err(FinalizeError::Layout(format!(
            "expected {} parts, found {}",
            upload.parts_count,
            parts.len()
        )));
    }

    let mut ordered: Vec<&Part> = parts.iter().collect();
    ordered.sort_by_key(|p| p.part_number);

    let mut keys = Vec::with_capacity(ordered.len());
    let mut expected_offset = 0i64;
    for (index, part) in ordered.into_iter().enumerate() {
        if part.part_number != index as i64 {
            return Err(FinalizeError::Layout(format!(
                "part numbers are not contiguous at {}",
                index
            )));
        }
        let meta = match (part.status, part.uploaded_metadata()) {
            (PartStatus::Uploaded, Some(meta)) => meta,
            _ => {
                return Err(FinalizeError::Layout(format!(
                    "part {} is not uploaded",
                    part.part_number
                )));
            }
        };
        if meta.byte_offset != expected_offset {
            return Err(FinalizeError::Layout(format!(
                "part {} starts at byte {}, expected {}",
                part.part_number, meta.byte_offset, expected_offset
            )));
        }
        expected_offset = expected_offset.checked_add(meta.byte_size).ok_or_else(|| {
            FinalizeError::Layout(format!(
                "part {} ends past the largest representable offset",
                part.part_number
            ))
        })?;
        keys.push(meta.object_key);
    }

    if expected_offset != upload.size {
        return Err(FinalizeError::Layout(format!(
            "parts cover {} bytes, upload declares {}",
            expected_offset, upload.size
        )));
    }
    Ok(keys)
}

/// Result of a successful finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub final_object_key: String,
    pub merge_calls: usize,
    pub levels: usize,
}

/// Drives a `ReductionPlan` against a blob store.
pub struct Finalizer {
    blobs: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    fan_in: usize,
}

impl Finalizer {
    /// `fan_in` is capped at what the store accepts.
    pub fn new(blobs: Arc<dyn BlobStore>, retry: RetryPolicy, fan_in: usize) -> Self {
        let fan_in = fan_in.min(blobs.max_fan_in());
        Self {
            blobs,
            retry,
            fan_in,
        }
    }

    /// Assemble the parts of `upload` into `final_key`.
    pub async fn finalize(
        &self,
        upload: &Upload,
        parts: &[Part],
        final_key: &str,
    ) -> FinalizeResult<FinalizeOutcome> {
        let keys = ordered_part_keys(upload, parts)?;
        let scratch_prefix = format!("{final_key}.compose");
        let plan = plan_reduction(&keys, self.fan_in, final_key, &scratch_prefix)?;
        debug_assert_eq!(plan.merge_count(), merge_call_bound(keys.len(), self.fan_in));

        if plan.is_alias() {
            info!(
                "upload {} has a single part; using {} as its final object",
                upload.id, plan.final_key
            );
            return Ok(FinalizeOutcome {
                final_object_key: plan.final_key,
                merge_calls: 0,
                levels: 0,
            });
        }

        info!(
            "finalizing upload {}: {} parts, {} merge calls over {} levels",
            upload.id,
            keys.len(),
            plan.merge_count(),
            plan.depth()
        );

        self.execute(&plan, &keys).await?;

        Ok(FinalizeOutcome {
            final_object_key: plan.final_key.clone(),
            merge_calls: plan.merge_count(),
            levels: plan.depth(),
        })
    }

    async fn execute(&self, plan: &ReductionPlan, part_keys: &[String]) -> FinalizeResult<()> {
        let parts: HashSet<&str> = part_keys.iter().map(String::as_str).collect();
        let mut scratch: HashSet<String> = HashSet::new();

        for (level, calls) in plan.levels.iter().enumerate() {
            debug!("merge level {}: {} calls", level, calls.len());
            let results = join_all(calls.iter().map(|call| self.merge_with_retry(call))).await;

            let mut failure = None;
            for (call, result) in calls.iter().zip(results) {
                match result {
                    Ok(()) if call.dst != plan.final_key => {
                        scratch.insert(call.dst.clone());
                    }
                    Ok(()) => {}
                    Err(err) if failure.is_none() => failure = Some(err),
                    Err(err) => warn!("additional merge failure: {}", err),
                }
            }
            if let Some(err) = failure {
                error!("finalization aborted at level {}: {}", level, err);
                self.discard(scratch.drain()).await;
                return Err(err);
            }

            let consumed: Vec<String> = calls
                .iter()
                .flat_map(|call| call.srcs.iter())
                .filter(|src| !parts.contains(src.as_str()) && scratch.remove(src.as_str()))
                .cloned()
                .collect();
            self.discard(consumed).await;
        }
        Ok(())
    }

    async fn merge_with_retry(&self, call: &MergeCall) -> FinalizeResult<()> {
        let blobs = &self.blobs;
        let dst = call.dst.as_str();
        let srcs = call.srcs.as_slice();
        self.retry
            .run("merge", move || blobs.merge(dst, srcs))
            .await
            .map_err(|source| FinalizeError::Merge {
                dst: call.dst.clone(),
                source,
            })
    }

    /// Best-effort removal of intermediate blobs.
    async fn discard(&self, keys: impl IntoIterator<Item = String>) {
        let keys: Vec<String> = keys.into_iter().collect();
        let results = join_all(keys.iter().map(|key| self.blobs.delete(key))).await;
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(()) => debug!("removed intermediate blob {}", key),
                Err(err) => warn!("leaked intermediate blob {}: {}", key, err),
            }
        }
    }
}
