use super::{
    config::ServiceConfig,
    data_source::DataSource,
    error::UploadError,
    provider::{provider_for, EngineContext, ProviderEngine},
    signing::{FileInfo, SigningChannel},
    transport::Transport,
};
use mime::Mime;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::{
    fmt,
    sync::{Arc, Mutex, RwLock, Weak},
    thread::Builder as ThreadBuilder,
};

/// Lifecycle state of one upload session.
///
/// `Complete` and `Cancelled` are terminal; every transition API is a
/// no-op once a session reaches either of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Waiting,
    Uploading,
    Paused,
    Complete,
    Cancelled,
    Error,
}

impl UploadStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "waiting",
            Self::Uploading => "uploading",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Observable snapshot of a session: status, percentage (one decimal)
/// and raw transferred byte count.
#[derive(Debug, Clone, Serialize)]
pub struct UploadState {
    pub status: UploadStatus,
    pub progress: f64,
    pub uploaded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for UploadState {
    fn default() -> Self {
        Self {
            status: UploadStatus::Waiting,
            progress: 0.0,
            uploaded: 0,
            error: None,
        }
    }
}

type Subscriber = Box<dyn Fn(&UploadState) + Send + Sync>;

/// Current state plus its subscribers. New subscribers immediately
/// receive the current value, so late observers never miss the terminal
/// transition.
#[derive(Default)]
struct StateCell {
    value: Mutex<UploadState>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl StateCell {
    fn current(&self) -> UploadState {
        self.value.lock().unwrap().to_owned()
    }

    fn update(&self, apply: impl FnOnce(&mut UploadState)) {
        let snapshot = {
            let mut value = self.value.lock().unwrap();
            apply(&mut value);
            value.to_owned()
        };
        for subscriber in self.subscribers.lock().unwrap().iter() {
            subscriber(&snapshot);
        }
    }

    fn subscribe(&self, subscriber: Subscriber) {
        subscriber(&self.current());
        self.subscribers.lock().unwrap().push(subscriber);
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("value", &self.value.lock().unwrap())
            .finish()
    }
}

#[derive(Debug)]
struct UploadSessionInner {
    source: Arc<dyn DataSource>,
    config: Arc<ServiceConfig>,
    transport: Arc<dyn Transport>,
    mime: Mime,
    parallelism: Mutex<usize>,
    retries: Mutex<u32>,
    params: JsonMap<String, JsonValue>,
    metadata: Mutex<JsonValue>,
    state: StateCell,
    access_url: RwLock<String>,
    channel: Mutex<Option<Arc<SigningChannel>>>,
    engine: Mutex<Option<Arc<dyn ProviderEngine>>>,
}

/// One file's upload from creation to a terminal state.
///
/// A session starts `Waiting`; [`resume`](Self::resume) asks the signing
/// server which provider the file lands on, builds the matching engine
/// and starts transferring. The session itself only tracks state, all
/// protocol work lives in the engine and its signing channel.
#[derive(Debug, Clone)]
pub struct UploadSession(Arc<UploadSessionInner>);

impl UploadSession {
    pub fn new(
        source: Arc<dyn DataSource>,
        config: Arc<ServiceConfig>,
        transport: Arc<dyn Transport>,
        parallelism: usize,
        retries: u32,
        params: JsonMap<String, JsonValue>,
    ) -> Self {
        let mime = source
            .mime_type()
            .cloned()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM);
        Self(Arc::new(UploadSessionInner {
            source,
            config,
            transport,
            mime,
            parallelism: Mutex::new(parallelism.max(1)),
            retries: Mutex::new(retries),
            params,
            metadata: Mutex::new(JsonValue::Null),
            state: Default::default(),
            access_url: Default::default(),
            channel: Default::default(),
            engine: Default::default(),
        }))
    }

    /// Current observable state snapshot.
    #[inline]
    pub fn state(&self) -> UploadState {
        self.0.state.current()
    }

    #[inline]
    pub fn status(&self) -> UploadStatus {
        self.state().status
    }

    #[inline]
    pub fn waiting(&self) -> bool {
        self.status() == UploadStatus::Waiting
    }

    #[inline]
    pub fn in_progress(&self) -> bool {
        self.status() == UploadStatus::Uploading
    }

    #[inline]
    pub fn completed(&self) -> bool {
        self.status() == UploadStatus::Complete
    }

    /// Subscribe to state changes. The callback fires immediately with
    /// the current state, then on every subsequent transition.
    pub fn subscribe(&self, subscriber: impl Fn(&UploadState) + Send + Sync + 'static) {
        self.0.state.subscribe(Box::new(subscriber));
    }

    #[inline]
    pub fn file_name(&self) -> String {
        self.0.source.file_name().to_owned()
    }

    #[inline]
    pub fn total_size(&self) -> u64 {
        self.0.source.total_size()
    }

    /// Public URL of the uploaded object, empty until the engine derives
    /// one from the first transfer signature.
    #[inline]
    pub fn access_url(&self) -> String {
        self.0.access_url.read().unwrap().to_owned()
    }

    /// Remaining retry budget. The library never spends it on its own;
    /// orchestrators pair [`consume_retry`](Self::consume_retry) with
    /// [`resume`](Self::resume) to implement bounded retries.
    #[inline]
    pub fn remaining_retries(&self) -> u32 {
        *self.0.retries.lock().unwrap()
    }

    /// Take one retry from the budget, failing once it is spent.
    pub fn consume_retry(&self) -> bool {
        let mut retries = self.0.retries.lock().unwrap();
        if *retries > 0 {
            *retries -= 1;
            true
        } else {
            false
        }
    }

    /// Caller-attached metadata, opaque to the engine.
    #[inline]
    pub fn metadata(&self) -> JsonValue {
        self.0.metadata.lock().unwrap().to_owned()
    }

    #[inline]
    pub fn set_metadata(&self, metadata: JsonValue) {
        *self.0.metadata.lock().unwrap() = metadata;
    }

    /// Start or restart transferring.
    ///
    /// No-op while uploading or once terminal. The first call negotiates
    /// the provider on a background thread; later calls re-enter the
    /// existing engine, which picks up from its outstanding part set.
    pub fn resume(&self, parallelism: Option<usize>) {
        let status = self.status();
        if status == UploadStatus::Uploading || status.is_terminal() {
            return;
        }
        if let Some(parallelism) = parallelism {
            *self.0.parallelism.lock().unwrap() = parallelism.max(1);
        }

        let existing = self.0.engine.lock().unwrap().to_owned();
        if let Some(engine) = existing {
            if self.try_enter_uploading() {
                engine.start();
            }
            return;
        }

        // mark uploading before spawning so a second resume() cannot
        // start a duplicate negotiation
        if !self.try_enter_uploading() {
            return;
        }
        let session = self.to_owned();
        let spawned = ThreadBuilder::new()
            .name("cloud-upload-manager.session".to_owned())
            .spawn(move || session.negotiate_provider());
        if let Err(err) = spawned {
            self.on_error(&format!("failed to spawn session thread: {}", err));
        }
    }

    /// Suspend transferring, keeping the engine and its part bookkeeping
    /// around so a later resume continues instead of starting over.
    pub fn pause(&self) {
        if self.status() != UploadStatus::Uploading {
            return;
        }
        let engine = self.0.engine.lock().unwrap().to_owned();
        match engine {
            Some(engine) => engine.pause(),
            // provider negotiation is still in flight; tripping the
            // token rejects it with an aborted reason
            None => self.abort_channel(),
        }
        self.0.state.update(|state| {
            if state.status == UploadStatus::Uploading {
                state.status = UploadStatus::Paused;
            }
        });
    }

    /// Cancel the session. While uploading this also tears down the
    /// engine and releases the server-side upload resource.
    pub fn cancel(&self) {
        let status = self.status();
        if status.is_terminal() {
            return;
        }
        if status == UploadStatus::Uploading {
            let engine = self.0.engine.lock().unwrap().to_owned();
            match engine {
                Some(engine) => engine.destroy(),
                None => self.abort_channel(),
            }
        }
        self.0.state.update(|state| {
            if !state.status.is_terminal() {
                state.status = UploadStatus::Cancelled;
            }
        });
    }

    pub(crate) fn downgrade(&self) -> SessionHandle {
        SessionHandle(Arc::downgrade(&self.0))
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn negotiate_provider(&self) {
        let inner = &self.0;
        let file = FileInfo {
            size: inner.source.total_size(),
            name: inner.source.file_name().to_owned(),
            dir_path: inner.source.dir_path().map(str::to_owned),
            mime: inner.mime.to_owned(),
        };
        let channel = Arc::new(SigningChannel::new(
            inner.config.to_owned(),
            inner.transport.to_owned(),
            file,
            inner.params.to_owned(),
        ));
        *inner.channel.lock().unwrap() = Some(channel.to_owned());

        let identity = match channel.initialise() {
            Ok(identity) => identity,
            Err(err) => {
                self.negotiation_failed(err);
                return;
            }
        };
        let factory = match provider_for(&identity.residence) {
            Some(factory) => factory,
            None => {
                log::error!("no provider registered for {:?}", identity.residence);
                self.on_error("no provider available to upload to");
                return;
            }
        };
        let context = EngineContext {
            source: inner.source.to_owned(),
            parallelism: *inner.parallelism.lock().unwrap(),
        };
        let engine = factory(channel, self.downgrade(), context);
        *inner.engine.lock().unwrap() = Some(engine.to_owned());
        // a pause or cancel may have landed while negotiating; only an
        // explicit resume() revives a session that left Uploading
        if self.in_progress() {
            engine.start();
        }
    }

    fn abort_channel(&self) {
        if let Some(channel) = self.0.channel.lock().unwrap().to_owned() {
            channel.abort();
        }
    }

    fn negotiation_failed(&self, err: UploadError) {
        if err.is_aborted() {
            log::debug!("provider negotiation aborted");
        } else {
            log::error!("provider negotiation failed: {}", err);
            self.on_error(&err.to_string());
        }
    }

    // cancel() may race the background negotiation; never revive a
    // terminal session
    fn try_enter_uploading(&self) -> bool {
        let mut entered = false;
        self.0.state.update(|state| {
            if !state.status.is_terminal() {
                state.status = UploadStatus::Uploading;
                state.error = None;
                entered = true;
            }
        });
        entered
    }

    fn on_progress(&self, uploaded: u64) {
        let size = self.total_size().max(1);
        self.0.state.update(|state| {
            if state.status == UploadStatus::Uploading {
                state.uploaded = uploaded;
                state.progress = (uploaded as f64 / size as f64 * 1000.0).floor() / 10.0;
            }
        });
    }

    fn on_complete(&self) {
        self.0.state.update(|state| {
            state.status = UploadStatus::Complete;
            state.progress = 100.0;
            state.error = None;
        });
    }

    fn on_error(&self, message: &str) {
        self.0.state.update(|state| {
            state.status = UploadStatus::Error;
            state.error = Some(message.to_owned());
        });
    }

    fn set_access_url(&self, url: &str) {
        *self.0.access_url.write().unwrap() = url.to_owned();
    }
}

/// Weak back-reference from an engine to its session.
///
/// Engines report progress and terminal transitions through this handle;
/// holding it weakly keeps the session's `Arc` graph cycle-free. All
/// calls on a handle whose session is gone are silently dropped.
#[derive(Debug, Clone)]
pub struct SessionHandle(Weak<UploadSessionInner>);

impl SessionHandle {
    pub fn upgrade(&self) -> Option<UploadSession> {
        self.0.upgrade().map(UploadSession)
    }

    fn with(&self, apply: impl FnOnce(UploadSession)) {
        if let Some(session) = self.upgrade() {
            apply(session);
        }
    }

    pub fn on_progress(&self, uploaded: u64) {
        self.with(|session| session.on_progress(uploaded));
    }

    pub fn on_complete(&self) {
        self.with(|session| session.on_complete());
    }

    pub fn on_error(&self, message: &str) {
        self.with(|session| session.on_error(message));
    }

    pub fn set_access_url(&self, url: &str) {
        self.with(|session| session.set_access_url(url));
    }

    pub fn cancel(&self) {
        self.with(|session| session.cancel());
    }
}
