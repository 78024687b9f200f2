use super::{cancellation::CancellationGuard, error::UploadResult};
use std::fmt::{self, Debug};

mod ureq;
pub use self::ureq::UreqTransport;

/// Incremental progress callback: `(transferred_bytes, total_bytes)`.
pub type ProgressCallback<'r> = &'r (dyn Fn(u64, u64) + Send + Sync);

/// Low-level HTTP seam.
///
/// Both signing-server calls and raw data transfers to cloud endpoints go
/// through this trait; tests substitute a scripted implementation.
pub trait Transport: Debug + Send + Sync {
    fn call(&self, request: TransportRequest<'_>) -> UploadResult<TransportResponse>;
}

/// A single outgoing HTTP request.
pub struct TransportRequest<'r> {
    method: &'r str,
    url: &'r str,
    headers: &'r [(String, String)],
    body: &'r [u8],
    cancellation: CancellationGuard,
    on_progress: Option<ProgressCallback<'r>>,
}

impl<'r> TransportRequest<'r> {
    pub fn new(method: &'r str, url: &'r str) -> Self {
        Self {
            method,
            url,
            headers: &[],
            body: &[],
            cancellation: Default::default(),
            on_progress: None,
        }
    }

    #[inline]
    pub fn headers(mut self, headers: &'r [(String, String)]) -> Self {
        self.headers = headers;
        self
    }

    #[inline]
    pub fn body(mut self, body: &'r [u8]) -> Self {
        self.body = body;
        self
    }

    #[inline]
    pub fn cancellation(mut self, guard: CancellationGuard) -> Self {
        self.cancellation = guard;
        self
    }

    #[inline]
    pub fn on_progress(mut self, callback: ProgressCallback<'r>) -> Self {
        self.on_progress = Some(callback);
        self
    }

    #[inline]
    pub fn method(&self) -> &str {
        self.method
    }

    #[inline]
    pub fn url(&self) -> &str {
        self.url
    }

    #[inline]
    pub fn header_entries(&self) -> &[(String, String)] {
        self.headers
    }

    #[inline]
    pub fn body_bytes(&self) -> &[u8] {
        self.body
    }

    #[inline]
    pub fn cancellation_guard(&self) -> &CancellationGuard {
        &self.cancellation
    }

    #[inline]
    pub fn progress_callback(&self) -> Option<ProgressCallback<'r>> {
        self.on_progress
    }
}

impl fmt::Debug for TransportRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// A received HTTP response with its body fully drained.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[inline]
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_renders_without_its_callback() {
        let on_progress = |_: u64, _: u64| {};
        let request = TransportRequest::new("PUT", "https://bucket.test/key")
            .body(b"payload")
            .on_progress(&on_progress);
        let rendered = format!("{:?}", request);
        assert!(rendered.contains("https://bucket.test/key"));
        assert!(rendered.contains("body_len: 7"));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = TransportResponse::new(
            206,
            vec![("Range".to_owned(), "bytes=0-99".to_owned())],
            Vec::new(),
        );
        assert_eq!(response.header("range"), Some("bytes=0-99"));
        assert_eq!(response.header("RANGE"), Some("bytes=0-99"));
        assert_eq!(response.header("location"), None);
        assert!(response.is_success());
        assert!(!TransportResponse::new(308, Vec::new(), Vec::new()).is_success());
    }
}
