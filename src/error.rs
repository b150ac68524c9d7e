use rsmpeg::error::RsmpegError;

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Errors produced by the capture pipeline. Errors coming out of the ffmpeg
/// backend are wrapped in `BackendError`.
#[derive(Debug)]
pub enum CaptureError {
    /// Invalid options, missing required stream or mismatched parameters at
    /// construction time.
    InvalidConfig(String),
    /// Device read or file write failure.
    Io(String),
    /// A codec send/receive pair was used outside of its contract.
    Protocol(&'static str),
    /// The audio sample FIFO has no room for the next resampled batch.
    FifoOverflow,
    /// Lifecycle misuse, e.g. writing a packet before the header.
    InvalidState(&'static str),
    /// An error captured from a background worker thread.
    Worker(String),
    BackendError(RsmpegError),
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            CaptureError::BackendError(ref internal) => Some(internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            CaptureError::InvalidConfig(ref msg) => write!(f, "invalid configuration: {}", msg),
            CaptureError::Io(ref msg) => write!(f, "i/o error: {}", msg),
            CaptureError::Protocol(msg) => write!(f, "codec protocol violation: {}", msg),
            CaptureError::FifoOverflow => write!(f, "audio sample fifo has insufficient space"),
            CaptureError::InvalidState(msg) => write!(f, "invalid lifecycle state: {}", msg),
            CaptureError::Worker(ref msg) => write!(f, "worker thread failed: {}", msg),
            CaptureError::BackendError(ref internal) => internal.fmt(f),
        }
    }
}

impl From<RsmpegError> for CaptureError {
    fn from(internal: RsmpegError) -> CaptureError {
        CaptureError::BackendError(internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn display_is_terse() {
        assert_eq!(
            CaptureError::FifoOverflow.to_string(),
            "audio sample fifo has insufficient space"
        );
        assert_eq!(
            CaptureError::InvalidState("trailer already written").to_string(),
            "invalid lifecycle state: trailer already written"
        );
    }

    #[test]
    fn backend_error_is_source() {
        let err = CaptureError::from(RsmpegError::OpenInputError);
        assert!(err.source().is_some());
        assert!(CaptureError::FifoOverflow.source().is_none());
    }
}
