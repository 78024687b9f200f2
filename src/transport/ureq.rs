use super::{
    super::error::{ErrorKind, UploadError, UploadResult},
    Transport, TransportRequest, TransportResponse,
};
use crate::cancellation::CancellationGuard;
use std::io::{Cursor, Error as IoError, ErrorKind as IoErrorKind, Read, Result as IoResult};
use ureq::{Agent, Error as UreqError};

/// Production [`Transport`] backed by a blocking [`ureq::Agent`].
#[derive(Debug, Clone)]
pub struct UreqTransport {
    agent: Agent,
}

impl UreqTransport {
    #[inline]
    pub fn new(agent: Agent) -> Self {
        Self { agent }
    }
}

impl Default for UreqTransport {
    #[inline]
    fn default() -> Self {
        Self::new(ureq::agent())
    }
}

impl From<Agent> for UreqTransport {
    #[inline]
    fn from(agent: Agent) -> Self {
        Self::new(agent)
    }
}

impl Transport for UreqTransport {
    fn call(&self, request: TransportRequest<'_>) -> UploadResult<TransportResponse> {
        let guard = request.cancellation_guard().to_owned();
        if guard.is_cancelled() {
            return Err(UploadError::aborted());
        }

        let mut ureq_request = self.agent.request(request.method(), request.url());
        for (name, value) in request.header_entries() {
            ureq_request = ureq_request.set(name, value);
        }

        let result = if request.body_bytes().is_empty() {
            ureq_request.call()
        } else {
            ureq_request = ureq_request.set("Content-Length", &request.body_bytes().len().to_string());
            ureq_request.send(BodyReader::new(
                request.body_bytes(),
                guard.to_owned(),
                request.progress_callback().map(|callback| {
                    let total = request.body_bytes().len() as u64;
                    move |transferred| callback(transferred, total)
                }),
            ))
        };

        match result {
            Ok(response) => drain_response(response, &guard),
            Err(UreqError::Status(_, response)) => drain_response(response, &guard),
            Err(UreqError::Transport(transport)) => {
                if guard.is_cancelled() {
                    Err(UploadError::aborted())
                } else {
                    Err(UploadError::new(ErrorKind::Transport, transport))
                }
            }
        }
    }
}

fn drain_response(response: ureq::Response, guard: &CancellationGuard) -> UploadResult<TransportResponse> {
    let status = response.status();
    let headers = response
        .headers_names()
        .into_iter()
        .filter_map(|name| {
            response
                .header(&name)
                .map(|value| (name.to_owned(), value.to_owned()))
        })
        .collect();
    let mut body = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|err| UploadError::new(ErrorKind::Transport, err))?;
    if guard.is_cancelled() {
        return Err(UploadError::aborted());
    }
    Ok(TransportResponse::new(status, headers, body))
}

/// Request body reader that reports progress and honors cancellation,
/// so an abort interrupts an in-flight transfer mid-stream.
struct BodyReader<'b, F> {
    data: Cursor<&'b [u8]>,
    guard: CancellationGuard,
    on_progress: Option<F>,
    have_read: u64,
}

impl<'b, F> BodyReader<'b, F> {
    fn new(data: &'b [u8], guard: CancellationGuard, on_progress: Option<F>) -> Self {
        Self {
            data: Cursor::new(data),
            guard,
            on_progress,
            have_read: 0,
        }
    }
}

impl<F: Fn(u64)> Read for BodyReader<'_, F> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        if self.guard.is_cancelled() {
            return Err(IoError::new(IoErrorKind::Other, "request aborted"));
        }
        let n = self.data.read(buf)?;
        if n > 0 {
            self.have_read += n as u64;
            if let Some(on_progress) = self.on_progress.as_ref() {
                on_progress(self.have_read);
            }
        }
        Ok(n)
    }
}
