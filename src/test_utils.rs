use super::{
    error::{ErrorKind, UploadError, UploadResult},
    session::{UploadSession, UploadState, UploadStatus},
    transport::{Transport, TransportRequest, TransportResponse},
};
use serde_json::Value as JsonValue;
use std::{
    fmt,
    sync::{
        mpsc::{channel, Receiver},
        Mutex, RwLock,
    },
    time::Duration,
};
use url::form_urlencoded;

pub(crate) fn init_logs() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// Session wired to the scripted transport and a test signing server.
pub(crate) fn scenario_session(
    transport: &std::sync::Arc<FakeTransport>,
    data: Vec<u8>,
    parallelism: usize,
) -> UploadSession {
    let config = std::sync::Arc::new(
        crate::ServiceConfig::builder("https://api.test/uploads")
            .bearer_token("tok")
            .build(),
    );
    let source = std::sync::Arc::new(crate::MemoryDataSource::new("payload.bin", data));
    UploadSession::new(
        source,
        config,
        transport.to_owned(),
        parallelism,
        4,
        serde_json::Map::new(),
    )
}

/// Stream every state transition of a session into a channel.
pub(crate) fn watch(session: &UploadSession) -> Receiver<UploadState> {
    let (tx, rx) = channel();
    session.subscribe(move |state| {
        tx.send(state.to_owned()).ok();
    });
    rx
}

/// Block until the watched session reaches the given status. Panics on
/// a timeout, or when the session errors while waiting for anything
/// else.
pub(crate) fn await_status(states: &Receiver<UploadState>, status: UploadStatus) -> UploadState {
    loop {
        let state = states
            .recv_timeout(Duration::from_secs(10))
            .unwrap_or_else(|_| panic!("timed out waiting for {}", status));
        if state.status == status {
            return state;
        }
        if state.status == UploadStatus::Error && status != UploadStatus::Error {
            panic!("upload failed: {:?}", state.error);
        }
    }
}

pub(crate) fn json_response(status: u16, value: JsonValue) -> TransportResponse {
    TransportResponse::new(
        status,
        vec![("Content-Type".to_owned(), "application/json".to_owned())],
        serde_json::to_vec(&value).unwrap(),
    )
}

pub(crate) fn response_with_headers(
    status: u16,
    headers: &[(&str, &str)],
    body: Vec<u8>,
) -> TransportResponse {
    TransportResponse::new(
        status,
        headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
        body,
    )
}

/// One request as the fake transport saw it.
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.to_owned())
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.url.split_once('?')?.1;
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn json(&self) -> JsonValue {
        serde_json::from_slice(&self.body).unwrap_or(JsonValue::Null)
    }
}

type Responder = Box<dyn Fn(&RecordedRequest) -> TransportResponse + Send + Sync>;

struct Route {
    method: String,
    url_fragment: String,
    responder: Responder,
}

/// Scripted in-memory [`Transport`]. Routes are matched by method and a
/// URL substring, in registration order, so register the more specific
/// route first. Every request is recorded for later assertions.
#[derive(Default)]
pub(crate) struct FakeTransport {
    routes: RwLock<Vec<Route>>,
    log: Mutex<Vec<RecordedRequest>>,
}

impl FakeTransport {
    pub fn route(
        &self,
        method: &str,
        url_fragment: &str,
        responder: impl Fn(&RecordedRequest) -> TransportResponse + Send + Sync + 'static,
    ) {
        self.routes.write().unwrap().push(Route {
            method: method.to_owned(),
            url_fragment: url_fragment.to_owned(),
            responder: Box::new(responder),
        });
    }

    pub fn json_route(&self, method: &str, url_fragment: &str, value: JsonValue) {
        self.route(method, url_fragment, move |_| {
            json_response(200, value.to_owned())
        });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().unwrap().to_owned()
    }

    pub fn count(&self, method: &str, url_fragment: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.method == method && request.url.contains(url_fragment))
            .count()
    }
}

impl fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeTransport")
            .field("requests", &self.log.lock().unwrap().len())
            .finish()
    }
}

impl Transport for FakeTransport {
    fn call(&self, request: TransportRequest<'_>) -> UploadResult<TransportResponse> {
        let guard = request.cancellation_guard().to_owned();
        if guard.is_cancelled() {
            return Err(UploadError::aborted());
        }
        let recorded = RecordedRequest {
            method: request.method().to_owned(),
            url: request.url().to_owned(),
            headers: request.header_entries().to_vec(),
            body: request.body_bytes().to_vec(),
        };
        if let Some(on_progress) = request.progress_callback() {
            let total = recorded.body.len() as u64;
            if total > 0 {
                on_progress(total / 2, total);
                on_progress(total, total);
            }
        }
        self.log.lock().unwrap().push(recorded.to_owned());

        let routes = self.routes.read().unwrap();
        let route = routes.iter().find(|route| {
            route.method == recorded.method && recorded.url.contains(&route.url_fragment)
        });
        match route {
            Some(route) => {
                let response = (route.responder)(&recorded);
                // responders may block; an abort landing meanwhile must
                // win, as it does on the draining production transport
                if guard.is_cancelled() {
                    return Err(UploadError::aborted());
                }
                Ok(response)
            }
            None => Err(UploadError::with_msg(
                ErrorKind::Transport,
                format!("no route for {} {}", recorded.method, recorded.url),
            )),
        }
    }
}
