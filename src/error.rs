use std::{error, fmt, io::Error as IoError};

/// Upload error category.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The library is misconfigured (no endpoint, no provider resolvable)
    Configuration,

    /// The computed part size exceeds the provider's hard cap, the file
    /// cannot be uploaded at all
    SizeLimit,

    /// A signing or data-transfer request failed in transit
    Transport,

    /// The remote end answered with a status code that was neither a
    /// success nor the explicitly expected one
    UnexpectedStatus,

    /// The response body could not be parsed
    InvalidResponse,

    /// An operation that requires an upload resource was invoked before
    /// `create()` produced one
    IllegalState,

    /// Local file I/O failed
    LocalIo,

    /// A system facility (thread pool, worker channel) failed
    SystemCall,

    /// The session's cancellation token was tripped. Deliberate pause and
    /// cancel produce this kind, it must never surface as a session error.
    Aborted,
}

/// Error type shared by every fallible operation in this crate.
pub struct UploadError {
    kind: ErrorKind,
    error: Box<dyn error::Error + Send + Sync>,
}

/// Result alias used across the crate.
pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    /// Wrap an existing error with a category.
    #[inline]
    pub fn new(kind: ErrorKind, err: impl Into<Box<dyn error::Error + Send + Sync>>) -> Self {
        Self {
            kind,
            error: err.into(),
        }
    }

    /// Create an error from a bare message.
    #[inline]
    pub fn with_msg(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self::new(kind, anyhow::anyhow!(msg.into()))
    }

    /// Create an [`ErrorKind::Aborted`] error.
    #[inline]
    pub fn aborted() -> Self {
        Self::with_msg(ErrorKind::Aborted, "request aborted")
    }

    /// Get the error category.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether this error was caused by a deliberate abort.
    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Aborted
    }

    #[inline]
    pub fn into_inner(self) -> Box<dyn error::Error + Send + Sync> {
        self.error
    }
}

impl fmt::Display for UploadError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl fmt::Debug for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadError")
            .field("kind", &self.kind)
            .field("error", &self.error)
            .finish()
    }
}

impl error::Error for UploadError {
    #[inline]
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

impl From<IoError> for UploadError {
    #[inline]
    fn from(err: IoError) -> Self {
        Self::new(ErrorKind::LocalIo, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aborted_is_distinguishable() {
        let aborted = UploadError::aborted();
        assert!(aborted.is_aborted());
        assert_eq!(aborted.kind(), ErrorKind::Aborted);

        let transport = UploadError::with_msg(ErrorKind::Transport, "connection reset");
        assert!(!transport.is_aborted());
        assert_eq!(transport.to_string(), "connection reset");
    }
}
