use super::{
    config::ServiceConfig,
    data_source::DataSource,
    session::{UploadSession, UploadStatus},
    transport::{Transport, UreqTransport},
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::Builder as ThreadBuilder,
    time::Duration,
};

/// Behavior knobs for [`UploadService`].
#[derive(Debug, Clone)]
pub struct UploadServiceOptions {
    /// Start queued uploads automatically, up to `simultaneous`.
    pub auto_start: bool,
    /// Drop finished sessions from the registry.
    pub auto_remove: bool,
    /// Delay before an auto-removed session disappears.
    pub remove_after: Option<Duration>,
    /// Ceiling on concurrently uploading sessions.
    pub simultaneous: usize,
    /// Worker count per session.
    pub parallelism: usize,
    /// Retry budget handed to every new session.
    pub retries: u32,
    /// Metadata attached to every new session.
    pub metadata: Option<JsonValue>,
}

impl Default for UploadServiceOptions {
    fn default() -> Self {
        Self {
            auto_start: true,
            auto_remove: false,
            remove_after: None,
            simultaneous: 2,
            parallelism: 3,
            retries: 4,
            metadata: None,
        }
    }
}

#[derive(Debug)]
struct ServiceInner {
    config: Arc<ServiceConfig>,
    transport: Arc<dyn Transport>,
    options: UploadServiceOptions,
    metadata: Mutex<Option<JsonValue>>,
    uploads: Mutex<Vec<UploadSession>>,
}

/// Registry and scheduler for a set of upload sessions.
///
/// The service creates sessions bound to one shared configuration and
/// transport, keeps at most `simultaneous` of them uploading, and feeds
/// the next waiting session in whenever one completes.
#[derive(Debug, Clone)]
pub struct UploadService(Arc<ServiceInner>);

impl UploadService {
    pub fn new(config: ServiceConfig, options: UploadServiceOptions) -> Self {
        Self::with_transport(config, options, Arc::new(UreqTransport::default()))
    }

    /// Build a service on a custom transport.
    pub fn with_transport(
        config: ServiceConfig,
        options: UploadServiceOptions,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let metadata = options.metadata.to_owned();
        Self(Arc::new(ServiceInner {
            config: Arc::new(config),
            transport,
            options,
            metadata: Mutex::new(metadata),
            uploads: Mutex::new(Vec::new()),
        }))
    }

    /// Register a new upload for the given source, passing extra
    /// parameters through to the signing server.
    pub fn upload(
        &self,
        source: Arc<dyn DataSource>,
        params: JsonMap<String, JsonValue>,
    ) -> UploadSession {
        let session = UploadSession::new(
            source,
            self.0.config.to_owned(),
            self.0.transport.to_owned(),
            self.0.options.parallelism,
            self.0.options.retries,
            params,
        );
        if let Some(metadata) = self.0.metadata.lock().unwrap().as_ref() {
            session.set_metadata(metadata.to_owned());
        }
        self.0.uploads.lock().unwrap().push(session.to_owned());

        let service = Arc::downgrade(&self.0);
        let handle = session.downgrade();
        let fired = AtomicBool::new(false);
        session.subscribe(move |state| {
            if state.status == UploadStatus::Complete && !fired.swap(true, Ordering::SeqCst) {
                if let Some(service) = service.upgrade() {
                    UploadService(service).session_completed(&handle);
                }
            }
        });

        if self.0.options.auto_start && self.active_count() < self.0.options.simultaneous {
            session.resume(Some(self.0.options.parallelism));
        }
        session
    }

    /// Snapshot of every registered session.
    pub fn list(&self) -> Vec<UploadSession> {
        self.0.uploads.lock().unwrap().to_owned()
    }

    pub fn pause_all(&self) {
        for session in self.list() {
            session.pause();
        }
    }

    pub fn resume_all(&self) {
        for session in self.list() {
            session.resume(Some(self.0.options.parallelism));
        }
    }

    /// Cancel a session and drop it from the registry.
    pub fn remove(&self, session: &UploadSession) {
        session.cancel();
        self.0
            .uploads
            .lock()
            .unwrap()
            .retain(|held| !held.ptr_eq(session));
    }

    pub fn remove_all(&self) {
        for session in self.list() {
            session.cancel();
        }
        self.0.uploads.lock().unwrap().clear();
    }

    pub fn remove_completed(&self) {
        self.0
            .uploads
            .lock()
            .unwrap()
            .retain(|session| !session.completed());
    }

    /// Replace the service metadata and push it to every session.
    pub fn update_metadata(&self, metadata: JsonValue) {
        *self.0.metadata.lock().unwrap() = Some(metadata.to_owned());
        for session in self.list() {
            session.set_metadata(metadata.to_owned());
        }
    }

    fn active_count(&self) -> usize {
        self.0
            .uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|session| session.in_progress())
            .count()
    }

    fn session_completed(&self, handle: &crate::session::SessionHandle) {
        if self.0.options.auto_remove {
            if let Some(session) = handle.upgrade() {
                match self.0.options.remove_after {
                    None => self.remove(&session),
                    Some(delay) => {
                        let service = self.to_owned();
                        ThreadBuilder::new()
                            .name("cloud-upload-manager.remove".to_owned())
                            .spawn(move || {
                                std::thread::sleep(delay);
                                service.remove(&session);
                            })
                            .ok();
                    }
                }
            }
        }
        if self.0.options.auto_start {
            self.feed_waiting();
        }
    }

    /// Start queued sessions until the simultaneous ceiling is reached.
    fn feed_waiting(&self) {
        while self.active_count() < self.0.options.simultaneous {
            let next = self.list().into_iter().find(|session| session.waiting());
            match next {
                Some(session) => session.resume(Some(self.0.options.parallelism)),
                None => break,
            }
        }
    }
}
