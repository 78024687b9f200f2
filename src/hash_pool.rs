use super::error::{ErrorKind, UploadError, UploadResult};
use digest::Digest;
use md5::Md5;
use once_cell::sync::Lazy;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc, Mutex, RwLock,
    },
    thread::Builder as ThreadBuilder,
};

/// Number of dedicated hashing workers.
pub const WORKER_COUNT: usize = 3;

/// Content digest of one part.
pub type PartDigest = [u8; 16];

static GLOBAL_POOL: Lazy<RwLock<Arc<HashWorkerPool>>> =
    Lazy::new(|| RwLock::new(Arc::new(HashWorkerPool::new(WORKER_COUNT))));

/// Replace the process-wide pool with freshly spawned workers.
///
/// Idempotent; the previous workers terminate once their job channels
/// drain. Calling this is optional, the pool is created lazily on first
/// use.
pub fn configure_hash_workers() {
    *GLOBAL_POOL.write().unwrap() = Arc::new(HashWorkerPool::new(WORKER_COUNT));
}

pub(crate) fn global_hash_pool() -> Arc<HashWorkerPool> {
    GLOBAL_POOL.read().unwrap().to_owned()
}

struct HashJob {
    data: Arc<Vec<u8>>,
    reply: Sender<PartDigest>,
}

/// Fixed pool of hashing threads with round-robin dispatch, so CPU-bound
/// digesting spreads across workers instead of queueing on one.
#[derive(Debug)]
pub struct HashWorkerPool {
    workers: Vec<HashWorker>,
    cursor: AtomicUsize,
}

struct HashWorker {
    jobs: Mutex<Sender<HashJob>>,
}

/// Pending digest computation; [`wait`](Self::wait) blocks until the
/// worker delivers.
#[derive(Debug)]
pub struct PendingDigest(Receiver<PartDigest>);

impl HashWorkerPool {
    pub fn new(worker_count: usize) -> Self {
        let workers = (0..worker_count)
            .map(|index| {
                let (tx, rx) = channel::<HashJob>();
                ThreadBuilder::new()
                    .name(format!("cloud-upload-manager.hash-worker.{}", index))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            let digest: PartDigest = Md5::digest(job.data.as_slice()).into();
                            job.reply.send(digest).ok();
                        }
                    })
                    .expect("failed to spawn hash worker");
                HashWorker {
                    jobs: Mutex::new(tx),
                }
            })
            .collect();
        Self {
            workers,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Dispatch a digest computation to the next worker.
    pub fn hash(&self, data: Arc<Vec<u8>>) -> PendingDigest {
        let (reply, receiver) = channel();
        let worker = &self.workers[self.next_index()];
        worker
            .jobs
            .lock()
            .unwrap()
            .send(HashJob { data, reply })
            .ok();
        PendingDigest(receiver)
    }

    fn next_index(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }
}

impl std::fmt::Debug for HashWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashWorker").finish()
    }
}

impl PendingDigest {
    pub fn wait(self) -> UploadResult<PartDigest> {
        self.0
            .recv()
            .map_err(|err| UploadError::new(ErrorKind::SystemCall, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_wraps() {
        let pool = HashWorkerPool::new(WORKER_COUNT);
        let indexes: Vec<_> = (0..7).map(|_| pool.next_index()).collect();
        assert_eq!(indexes, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_digests_match_reference() {
        let pool = HashWorkerPool::new(WORKER_COUNT);
        let pending: Vec<_> = (0..6)
            .map(|i| pool.hash(Arc::new(vec![i as u8; 128])))
            .collect();
        for (i, pending) in pending.into_iter().enumerate() {
            let expected: PartDigest = Md5::digest(vec![i as u8; 128].as_slice()).into();
            assert_eq!(pending.wait().unwrap(), expected);
        }
    }

    #[test]
    fn test_global_pool_reconfigure() {
        configure_hash_workers();
        let digest = global_hash_pool()
            .hash(Arc::new(b"hello".to_vec()))
            .wait()
            .unwrap();
        assert_eq!(hex::encode(digest), "5d41402abc4b2a76b9719d911017c592");
    }
}
