use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

/// Cancellation token shared by every request a signing channel issues.
///
/// Cancellation works in generations: [`cancel`](Self::cancel) trips the
/// current generation, rejecting everything in flight, while
/// [`renew`](Self::renew) installs a fresh generation so that a paused
/// engine can be restarted on the same channel. Requests hold on to the
/// generation that was current when they started, so a stale transfer
/// still observes its own abort after a renew.
#[derive(Debug, Default)]
pub struct CancellationToken {
    generation: RwLock<Arc<AtomicBool>>,
}

/// Handle on one cancellation generation, cheap to clone into a request.
#[derive(Debug, Clone, Default)]
pub struct CancellationGuard(Arc<AtomicBool>);

impl CancellationToken {
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    /// Capture the current generation for a single request.
    pub fn guard(&self) -> CancellationGuard {
        CancellationGuard(self.generation.read().unwrap().to_owned())
    }

    /// Trip the current generation.
    pub fn cancel(&self) {
        self.generation.read().unwrap().store(true, Ordering::SeqCst);
    }

    /// Install a fresh generation, leaving any tripped one behind.
    pub fn renew(&self) {
        *self.generation.write().unwrap() = Default::default();
    }

    /// Whether the current generation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.generation.read().unwrap().load(Ordering::SeqCst)
    }
}

impl CancellationGuard {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
