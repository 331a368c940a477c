//! # Sync Engine
//!
//! Authenticated pull/push replication between a local store and a peer.
//!
//! ## Pull
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          PULL                                   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  1. Summarize local ids as a bloom digest                       │
//! │  2. findNewEntries(bloom) → metadata only                       │
//! │  3. Partition into batches under the 50 MB payload ceiling      │
//! │  4. Per batch: getEntries → verify signature + signer trust     │
//! │     → resolve missing dependencies (stop at doc_snapshot)       │
//! │     → insert in topological order → progress event              │
//! │  5. Report { transferred_entries, cancelled }                   │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Push is the same dance with the roles inverted; the remote's id set is
//! fetched explicitly since only it knows what it holds.
//!
//! Failure policy: transport errors retry with bounded backoff
//! (50/200/1000 ms); a failed batch is recorded and the sync moves on,
//! unless the failure is `Cancelled`, `Corruption`, or `UnknownSigner`
//! (potential attack), which abort the run. Entries that cannot be
//! *decrypted* are not failures at all — they are stored and relayed.

pub mod peer;
pub mod transport;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Future;

use crate::directory::TrustProvider;
use crate::document::assembler::topological_sort;
use crate::entry::{codec, Entry, EntryMetadata, EntryType};
use crate::error::{Error, Result};
use crate::store::{EntryStore, HaveSet, ResolveOptions};

pub use peer::{LocalPeer, RemotePeer, SyncPeer};
pub use transport::{SyncTransport, TransportMethod, TransportRequest, TransportResponse};

/// Default batch payload ceiling: 50 MB of ciphertext per getEntries call
pub const DEFAULT_BATCH_PAYLOAD_LIMIT: u64 = transport::MAX_PAYLOAD_BYTES;

/// Cooperative cancellation flag, polled at batch boundaries.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Which part of a sync run a progress event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Exchanging id digests and metadata
    Diff,
    /// Moving entry batches
    Transfer,
    /// Finished (successfully, cancelled, or with failed batches)
    Done,
}

/// One progress event. Events are emitted in order, on the caller's task.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub transferred: usize,
    pub total: Option<usize>,
}

pub type ProgressCallback = Arc<dyn Fn(SyncProgress) + Send + Sync>;

/// Bounded retry for transport failures.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub attempts: usize,
    pub delays_ms: Vec<u64>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            attempts: 3,
            delays_ms: vec![50, 200, 1000],
        }
    }
}

/// Options for a sync run.
#[derive(Clone, Default)]
pub struct SyncOptions {
    /// Restrict the run to one document
    pub doc_id: Option<String>,
    /// Override the batch payload ceiling (0 = default)
    pub batch_payload_limit: u64,
    pub progress: Option<ProgressCallback>,
    pub cancellation: Option<CancellationToken>,
    pub retry: Option<RetrySchedule>,
}

impl SyncOptions {
    fn payload_limit(&self) -> u64 {
        if self.batch_payload_limit == 0 {
            DEFAULT_BATCH_PAYLOAD_LIMIT
        } else {
            self.batch_payload_limit
        }
    }

    fn retry_schedule(&self) -> RetrySchedule {
        self.retry.clone().unwrap_or_default()
    }

    fn cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    fn emit(&self, phase: SyncPhase, transferred: usize, total: Option<usize>) {
        if let Some(progress) = &self.progress {
            progress(SyncProgress {
                phase,
                transferred,
                total,
            });
        }
    }
}

/// The outcome of a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub transferred_entries: usize,
    pub cancelled: bool,
    /// Batches that failed after retries (non-aborting failures only)
    pub failed_batches: usize,
}

/// Pull every entry the peer has that the local store lacks.
pub async fn pull_changes(
    local: &dyn EntryStore,
    remote: &dyn SyncPeer,
    trust: Option<&dyn TrustProvider>,
    options: &SyncOptions,
) -> Result<SyncResult> {
    let retry = options.retry_schedule();
    let mut result = SyncResult::default();

    let have = HaveSet::Bloom(local.id_bloom_summary().await?);
    let missing = with_retry(&retry, || {
        remote.find_new_entries(&have, options.doc_id.as_deref())
    })
    .await?;
    let total = missing.len();
    options.emit(SyncPhase::Diff, 0, Some(total));

    for batch in plan_batches(missing, options.payload_limit()) {
        if options.cancelled() {
            result.cancelled = true;
            break;
        }
        match pull_batch(local, remote, trust, &batch, &retry).await {
            Ok(transferred) => {
                result.transferred_entries += transferred;
                options.emit(SyncPhase::Transfer, result.transferred_entries, Some(total));
            }
            Err(e) if e.aborts_sync() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, batch_size = batch.len(), "sync batch failed");
                result.failed_batches += 1;
            }
        }
    }

    options.emit(SyncPhase::Done, result.transferred_entries, Some(total));
    Ok(result)
}

/// Push every local entry the peer lacks.
pub async fn push_changes(
    local: &dyn EntryStore,
    remote: &dyn SyncPeer,
    options: &SyncOptions,
) -> Result<SyncResult> {
    let retry = options.retry_schedule();
    let mut result = SyncResult::default();

    let remote_ids: HashSet<String> = with_retry(&retry, || remote.get_all_ids())
        .await?
        .into_iter()
        .collect();
    let have = HaveSet::Ids(remote_ids);
    let missing = match &options.doc_id {
        Some(doc_id) => local.find_new_entries_for_doc(&have, doc_id).await?,
        None => local.find_new_entries(&have).await?,
    };
    let total = missing.len();
    options.emit(SyncPhase::Diff, 0, Some(total));

    for batch in plan_batches(missing, options.payload_limit()) {
        if options.cancelled() {
            result.cancelled = true;
            break;
        }
        let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
        let entries = local.get_entries(&ids).await?;
        let sorted = topological_sort(&entries)?;

        match with_retry(&retry, || remote.put_entries(&sorted)).await {
            Ok(()) => {
                result.transferred_entries += sorted.len();
                options.emit(SyncPhase::Transfer, result.transferred_entries, Some(total));
            }
            Err(e) if e.aborts_sync() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, batch_size = batch.len(), "push batch failed");
                result.failed_batches += 1;
            }
        }
    }

    options.emit(SyncPhase::Done, result.transferred_entries, Some(total));
    Ok(result)
}

/// Pull then push against the same peer.
pub async fn sync_changes(
    local: &dyn EntryStore,
    remote: &dyn SyncPeer,
    trust: Option<&dyn TrustProvider>,
    options: &SyncOptions,
) -> Result<SyncResult> {
    let pulled = pull_changes(local, remote, trust, options).await?;
    if pulled.cancelled {
        return Ok(pulled);
    }
    let pushed = push_changes(local, remote, options).await?;
    Ok(SyncResult {
        transferred_entries: pulled.transferred_entries + pushed.transferred_entries,
        cancelled: pushed.cancelled,
        failed_batches: pulled.failed_batches + pushed.failed_batches,
    })
}

/// Process one pull batch: fetch, verify, resolve missing dependencies,
/// insert topologically. Returns how many entries were new locally.
async fn pull_batch(
    local: &dyn EntryStore,
    remote: &dyn SyncPeer,
    trust: Option<&dyn TrustProvider>,
    batch: &[EntryMetadata],
    retry: &RetrySchedule,
) -> Result<usize> {
    let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
    let mut entries: Vec<Entry> = with_retry(retry, || remote.get_entries(&ids)).await?;

    for entry in &entries {
        codec::verify(entry, trust)?;
    }

    // Dependencies may be missing locally (bloom false positives, partial
    // histories). Resolve them from the peer, cutting below snapshots.
    let mut known: HashSet<String> = entries.iter().map(|e| e.id.clone()).collect();
    let mut to_check: Vec<String> = entries
        .iter()
        .flat_map(|e| e.dependency_ids.iter().cloned())
        .filter(|dep| !known.contains(dep))
        .collect();
    to_check.sort();
    to_check.dedup();

    if !to_check.is_empty() {
        let present: HashSet<String> =
            local.has_entries(&to_check).await?.into_iter().collect();
        let unresolved: Vec<String> = to_check
            .into_iter()
            .filter(|dep| !present.contains(dep))
            .collect();

        let snapshot_cut = ResolveOptions {
            stop_at_entry_type: Some(EntryType::DocSnapshot),
        };
        for dep in unresolved {
            if known.contains(&dep) {
                continue;
            }
            let ancestry =
                with_retry(retry, || remote.resolve_dependencies(&dep, &snapshot_cut)).await?;
            let needed: Vec<String> = {
                let local_has: HashSet<String> =
                    local.has_entries(&ancestry).await?.into_iter().collect();
                ancestry
                    .into_iter()
                    .filter(|id| !known.contains(id) && !local_has.contains(id))
                    .collect()
            };
            if needed.is_empty() {
                continue;
            }
            let extra = with_retry(retry, || remote.get_entries(&needed)).await?;
            for entry in &extra {
                codec::verify(entry, trust)?;
                known.insert(entry.id.clone());
            }
            entries.extend(extra);
        }
    }

    let all_ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
    let already: HashSet<String> = local.has_entries(&all_ids).await?.into_iter().collect();
    let new_count = entries.iter().filter(|e| !already.contains(&e.id)).count();

    let sorted = topological_sort(&entries)?;
    local.put_entries(&sorted).await?;
    Ok(new_count)
}

/// Split metadata into batches whose summed ciphertext size stays under
/// the payload ceiling (every batch holds at least one entry).
fn plan_batches(missing: Vec<EntryMetadata>, limit: u64) -> Vec<Vec<EntryMetadata>> {
    let mut batches = Vec::new();
    let mut current: Vec<EntryMetadata> = Vec::new();
    let mut current_size: u64 = 0;

    for metadata in missing {
        if !current.is_empty() && current_size + metadata.encrypted_size > limit {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += metadata.encrypted_size;
        current.push(metadata);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Retry transport-kind failures with the schedule's backoff; every other
/// error returns immediately.
async fn with_retry<T, F, Fut>(schedule: &RetrySchedule, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < schedule.attempts => {
                let delay = schedule
                    .delays_ms
                    .get(attempt)
                    .copied()
                    .unwrap_or_else(|| schedule.delays_ms.last().copied().unwrap_or(1000));
                tracing::debug!(error = %e, attempt, delay_ms = delay, "retrying transport operation");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
