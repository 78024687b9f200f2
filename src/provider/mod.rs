use super::{
    error::UploadResult,
    hash_pool::global_hash_pool,
    session::SessionHandle,
    signing::{PartRecord, SigningChannel, UploadStrategy},
};
use crossbeam_utils::Backoff;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::{
    collections::{HashMap, VecDeque},
    fmt::Debug,
    sync::{Arc, Mutex, RwLock},
};

mod amazon;
mod azure;
mod fixed;
mod google;
mod openstack;

pub use amazon::AMAZON_S3;
pub use azure::MICROSOFT_AZURE;
pub use google::GOOGLE_CLOUD_STORAGE;
pub use openstack::OPENSTACK_SWIFT;

/// A provider-specific upload engine.
///
/// Engines own the transfer protocol against one cloud provider. They
/// are driven by the session: `start` (also used to re-enter after a
/// pause), `pause` and `destroy`. All transfer work happens on threads
/// the engine spawns; none of the three calls block.
pub trait ProviderEngine: Debug + Send + Sync {
    fn start(self: Arc<Self>);
    fn pause(&self);
    fn destroy(&self);
}

/// Everything a factory needs besides the signing channel.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub source: Arc<dyn super::data_source::DataSource>,
    pub parallelism: usize,
}

pub type ProviderFactory =
    fn(Arc<SigningChannel>, SessionHandle, EngineContext) -> Arc<dyn ProviderEngine>;

static REGISTRY: Lazy<RwLock<HashMap<String, ProviderFactory>>> = Lazy::new(|| {
    let mut registry = HashMap::new();
    builtin_providers(&mut registry);
    RwLock::new(registry)
});

fn builtin_providers(registry: &mut HashMap<String, ProviderFactory>) {
    registry.insert(AMAZON_S3.to_owned(), fixed::FixedPartEngine::<amazon::AmazonS3>::factory as ProviderFactory);
    registry.insert(MICROSOFT_AZURE.to_owned(), fixed::FixedPartEngine::<azure::MicrosoftAzure>::factory as ProviderFactory);
    registry.insert(OPENSTACK_SWIFT.to_owned(), fixed::FixedPartEngine::<openstack::OpenStackSwift>::factory as ProviderFactory);
    registry.insert(GOOGLE_CLOUD_STORAGE.to_owned(), google::GoogleCloudEngine::factory as ProviderFactory);
}

/// Register a custom provider engine under a residence name, replacing
/// any previous registration.
pub fn register_provider(residence: impl Into<String>, factory: ProviderFactory) {
    REGISTRY.write().unwrap().insert(residence.into(), factory);
}

pub(crate) fn provider_for(residence: &str) -> Option<ProviderFactory> {
    REGISTRY.read().unwrap().get(residence).copied()
}

/// Engine lifecycle, ordered so `state < Completed` reads as "still
/// cancellable".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum EngineState {
    Paused,
    Uploading,
    Completed,
    Aborted,
}

/// Where the engine stands with the upload resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Initiation {
    /// No create() issued yet (or a pause rolled the engine back here)
    NotStarted,
    /// create() is in flight
    Creating,
    /// The server answered create() with a strategy
    Active(UploadStrategy),
}

/// What a worker that drew an out-of-range part index must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExhaustionOutcome {
    /// Every real part is done and this worker won the finalization
    Finalize,
    /// Other parts are still outstanding; checkpoint them and stop
    Checkpoint(Vec<u64>),
    /// Finalization already claimed, just stop
    Ignore,
}

#[derive(Debug, Default)]
struct PartLedger {
    /// Parts currently held by a worker
    current: Vec<u64>,
    /// Parts queued for pickup, ahead of the counter
    pending: VecDeque<u64>,
    /// Highest part index handed out so far
    last: u64,
    finishing: bool,
}

/// State shared by every engine: lifecycle, part bookkeeping, per-part
/// progress and the memo of hashed parts.
#[derive(Debug)]
pub(crate) struct EngineCore {
    size: u64,
    state: Mutex<EngineState>,
    initiation: Mutex<Initiation>,
    ledger: Mutex<PartLedger>,
    progress: PartProgress,
    memo: DashMap<u64, PartRecord>,
}

impl EngineCore {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            state: Mutex::new(EngineState::Paused),
            initiation: Mutex::new(Initiation::NotStarted),
            ledger: Default::default(),
            progress: Default::default(),
            memo: Default::default(),
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    #[inline]
    pub fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap() = state;
    }

    #[inline]
    pub fn is_uploading(&self) -> bool {
        self.state() == EngineState::Uploading
    }

    /// Enter `Uploading` unless the engine is already uploading or ran
    /// to completion.
    pub fn try_enter_uploading(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state < EngineState::Uploading {
            *state = EngineState::Uploading;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn initiation(&self) -> Initiation {
        self.initiation.lock().unwrap().to_owned()
    }

    #[inline]
    pub fn set_initiation(&self, initiation: Initiation) {
        *self.initiation.lock().unwrap() = initiation;
    }

    /// Hand out the next part index: queued parts first, then the
    /// counter.
    pub fn allocate_part(&self) -> u64 {
        let mut ledger = self.ledger.lock().unwrap();
        let part = match ledger.pending.pop_front() {
            Some(queued) => {
                // the counter continues from wherever the queue left off
                ledger.last = queued;
                queued
            }
            None => {
                ledger.last += 1;
                ledger.last
            }
        };
        ledger.current.push(part);
        part
    }

    /// Give back a part that was allocated but never transferred.
    pub fn return_part(&self, part: u64) {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.current.retain(|&held| held != part);
        ledger.pending.push_front(part);
    }

    /// Mark a part fully transferred.
    pub fn complete_part(&self, part: u64) {
        self.ledger.lock().unwrap().current.retain(|&held| held != part);
    }

    /// Snapshot of every not-yet-completed part, in-flight first.
    pub fn outstanding_parts(&self) -> Vec<u64> {
        let ledger = self.ledger.lock().unwrap();
        ledger
            .current
            .iter()
            .chain(ledger.pending.iter())
            .copied()
            .collect()
    }

    /// Queue recovered part indexes for pickup.
    pub fn seed_pending(&self, parts: impl IntoIterator<Item = u64>) {
        self.ledger.lock().unwrap().pending.extend(parts);
    }

    /// Deduplicate and sort the pending queue.
    pub fn normalize_pending(&self) {
        let mut ledger = self.ledger.lock().unwrap();
        let mut parts: Vec<u64> = ledger.pending.iter().copied().collect();
        parts.sort_unstable();
        parts.dedup();
        ledger.pending = parts.into();
    }

    /// Move every in-flight part back to the queue (pause path), so the
    /// next start picks them up again.
    pub fn migrate_current_to_pending(&self) {
        let mut ledger = self.ledger.lock().unwrap();
        let mut pending: VecDeque<u64> = ledger.current.drain(..).collect();
        pending.append(&mut ledger.pending);
        ledger.pending = pending;
        // an aborted finalization must be retried on the next start
        ledger.finishing = false;
    }

    /// Forget all part bookkeeping (restart-from-scratch path).
    pub fn reset_parts(&self) {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.current.clear();
        ledger.pending.clear();
        ledger.last = 0;
        ledger.finishing = false;
    }

    /// Resolve a part index that fell past the end of the file.
    ///
    /// Decided atomically under the ledger lock: exactly one worker may
    /// observe the empty ledger and win the finalization, concurrent
    /// losers are told to checkpoint or stand down.
    pub fn resolve_exhausted(&self, part: u64) -> ExhaustionOutcome {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.current.retain(|&held| held != part);
        if ledger.finishing {
            ExhaustionOutcome::Ignore
        } else if ledger.current.is_empty() && ledger.pending.is_empty() {
            ledger.finishing = true;
            ExhaustionOutcome::Finalize
        } else {
            ExhaustionOutcome::Checkpoint(
                ledger
                    .current
                    .iter()
                    .chain(ledger.pending.iter())
                    .copied()
                    .collect(),
            )
        }
    }

    /// Digest a part, reusing the memoized record when the part was
    /// hashed in an earlier run.
    pub fn hash_part(&self, part: u64, data: &Arc<Vec<u8>>) -> UploadResult<PartRecord> {
        if let Some(record) = self.memo.get(&part) {
            return Ok(record.to_owned());
        }
        let digest = global_hash_pool().hash(data.to_owned()).wait()?;
        let record = PartRecord {
            part,
            md5: hex::encode(digest),
            size_bytes: Some(data.len() as u64),
            path: None,
        };
        self.memo.insert(part, record.to_owned());
        Ok(record)
    }

    #[inline]
    pub fn memo_record(&self, part: u64) -> Option<PartRecord> {
        self.memo.get(&part).map(|record| record.to_owned())
    }

    #[inline]
    pub fn insert_memo(&self, record: PartRecord) {
        self.memo.insert(record.part, record);
    }

    pub fn set_memo_path(&self, part: u64, path: &str) {
        if let Some(mut record) = self.memo.get_mut(&part) {
            record.path = Some(path.to_owned());
        }
    }

    /// Memoized parts that are still pathless, i.e. hashed but never
    /// acknowledged by the provider.
    pub fn pathless_memo_parts(&self) -> Vec<u64> {
        self.memo
            .iter()
            .filter(|record| record.path.is_none())
            .map(|record| record.part)
            .collect()
    }

    /// Memoized records for the given part indexes.
    pub fn part_data_snapshot(&self, parts: &[u64]) -> Vec<PartRecord> {
        parts
            .iter()
            .filter_map(|part| self.memo_record(*part))
            .collect()
    }

    /// Memoized records for parts `1..`, stopping at the first gap.
    pub fn contiguous_memo_records(&self) -> Vec<PartRecord> {
        let mut records = Vec::new();
        let mut part = 1;
        while let Some(record) = self.memo_record(part) {
            records.push(record);
            part += 1;
        }
        records
    }

    #[inline]
    pub fn update_progress(&self, part: u64, loaded: u64, total: u64) {
        self.progress.update(part, loaded, total);
    }

    #[inline]
    pub fn zero_incomplete_progress(&self) {
        self.progress.zero_incomplete();
    }

    /// Push the summed transfer progress to the session.
    pub fn publish_progress(&self, session: &SessionHandle) {
        session.on_progress(self.progress.total_loaded());
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PartTransfer {
    loaded: u64,
    total: u64,
}

/// Per-part transfer counters, summed into the session's byte total.
/// Lock acquisition spins with a [`Backoff`] so progress callbacks from
/// concurrent transfers never block each other for long.
#[derive(Debug, Default)]
pub(crate) struct PartProgress(RwLock<HashMap<u64, PartTransfer>>);

impl PartProgress {
    pub fn update(&self, part: u64, loaded: u64, total: u64) {
        let backoff = Backoff::new();
        loop {
            if let Ok(mut map) = self.0.try_write() {
                map.insert(part, PartTransfer { loaded, total });
                return;
            }
            backoff.spin();
        }
    }

    /// Drop the counters of unfinished transfers (pause path), keeping
    /// completed parts counted.
    pub fn zero_incomplete(&self) {
        let backoff = Backoff::new();
        loop {
            if let Ok(mut map) = self.0.try_write() {
                for transfer in map.values_mut() {
                    if transfer.loaded != transfer.total {
                        transfer.loaded = 0;
                    }
                }
                return;
            }
            backoff.spin();
        }
    }

    pub fn total_loaded(&self) -> u64 {
        let backoff = Backoff::new();
        loop {
            if let Ok(map) = self.0.try_read() {
                return map.values().map(|transfer| transfer.loaded).sum();
            }
            backoff.spin();
        }
    }
}

/// Base64 of the raw digest bytes, the content id format S3, Azure and
/// Google expect.
pub(crate) fn base64_content_id(record: &PartRecord) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    match hex::decode(&record.md5) {
        Ok(digest) => STANDARD.encode(digest),
        Err(_) => record.md5.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_counts_up_from_queue() {
        let core = EngineCore::new(1024);
        assert_eq!(core.allocate_part(), 1);
        assert_eq!(core.allocate_part(), 2);
        core.seed_pending([7, 9]);
        assert_eq!(core.allocate_part(), 7);
        assert_eq!(core.allocate_part(), 9);
        // counter continues after the queue drains
        assert_eq!(core.allocate_part(), 10);
        assert_eq!(core.outstanding_parts(), vec![1, 2, 7, 9, 10]);
    }

    #[test]
    fn test_returned_part_is_reallocated_first() {
        let core = EngineCore::new(1024);
        core.allocate_part();
        core.allocate_part();
        core.return_part(1);
        assert_eq!(core.outstanding_parts(), vec![2, 1]);
        assert_eq!(core.allocate_part(), 1);
    }

    #[test]
    fn test_outstanding_parts_track_completion() {
        let core = EngineCore::new(1024);
        core.allocate_part();
        core.allocate_part();
        core.allocate_part();
        core.complete_part(2);
        assert_eq!(core.outstanding_parts(), vec![1, 3]);
    }

    #[test]
    fn test_exactly_one_finalizer() {
        let core = EngineCore::new(1024);
        let a = core.allocate_part();
        let b = core.allocate_part();
        assert_eq!(
            core.resolve_exhausted(a),
            ExhaustionOutcome::Checkpoint(vec![b])
        );
        assert_eq!(core.resolve_exhausted(b), ExhaustionOutcome::Finalize);
        let c = core.allocate_part();
        assert_eq!(core.resolve_exhausted(c), ExhaustionOutcome::Ignore);
    }

    #[test]
    fn test_migrate_preserves_in_flight_order() {
        let core = EngineCore::new(1024);
        core.allocate_part();
        core.allocate_part();
        core.seed_pending([5]);
        core.migrate_current_to_pending();
        assert_eq!(core.outstanding_parts(), vec![1, 2, 5]);
        assert_eq!(core.allocate_part(), 1);
    }

    #[test]
    fn test_normalize_pending_dedupes_and_sorts() {
        let core = EngineCore::new(1024);
        core.seed_pending([5, 2, 5, 3, 2]);
        core.normalize_pending();
        assert_eq!(core.outstanding_parts(), vec![2, 3, 5]);
    }

    #[test]
    fn test_hash_part_memoizes() {
        let core = EngineCore::new(1024);
        let data = Arc::new(b"hello".to_vec());
        let record = core.hash_part(4, &data).unwrap();
        assert_eq!(record.md5, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(record.size_bytes, Some(5));

        // second call must reuse the memo even with different bytes
        let record = core.hash_part(4, &Arc::new(b"other".to_vec())).unwrap();
        assert_eq!(record.md5, "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_contiguous_memo_stops_at_gap() {
        let core = EngineCore::new(1024);
        for part in [1, 2, 4] {
            core.insert_memo(PartRecord {
                part,
                md5: format!("{:032x}", part),
                size_bytes: Some(8),
                path: None,
            });
        }
        let records = core.contiguous_memo_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].part, 2);
    }

    #[test]
    fn test_progress_zeroing_keeps_completed() {
        let progress = PartProgress::default();
        progress.update(1, 100, 100);
        progress.update(2, 40, 100);
        assert_eq!(progress.total_loaded(), 140);
        progress.zero_incomplete();
        assert_eq!(progress.total_loaded(), 100);
    }

    #[test]
    fn test_base64_content_id() {
        let record = PartRecord {
            part: 1,
            md5: "5d41402abc4b2a76b9719d911017c592".to_owned(),
            size_bytes: Some(5),
            path: None,
        };
        assert_eq!(base64_content_id(&record), "XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[test]
    fn test_builtin_providers_registered() {
        for residence in [AMAZON_S3, MICROSOFT_AZURE, GOOGLE_CLOUD_STORAGE, OPENSTACK_SWIFT] {
            assert!(provider_for(residence).is_some(), "{}", residence);
        }
        assert!(provider_for("FloppyDisk").is_none());
    }
}
