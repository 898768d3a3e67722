use reqwest::StatusCode;
use std::time::Duration;

/// Misuse of the range map. These are programming or configuration errors,
/// never transient conditions.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeMapError {
    #[error("too many active segments (max {max})")]
    CapacityExceeded { max: usize },

    #[error("segment at {start} cannot shrink from {current} to {requested} bytes")]
    LengthDecreased { start: u64, current: u64, requested: u64 },

    #[error("no segment starts at offset {start}")]
    UnknownSegment { start: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("http status error: {0}")]
    Status(StatusCode),

    /// The server answered a non-zero range request with the whole body.
    #[error("server ignored range request starting at {start}")]
    RangeIgnored { start: u64 },

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no data received for {:.1}s on a single read", .0.as_secs_f64())]
    ReadTimeout(Duration),

    #[error("transfer stalled: no progress for {:.1}s", .0.as_secs_f64())]
    Stalled(Duration),

    #[error(transparent)]
    RangeMap(#[from] RangeMapError),

    #[error("download cancelled")]
    Cancelled,

    #[error("download incomplete: {remaining} of {total} bytes missing")]
    Incomplete { remaining: u64, total: u64 },
}

impl DownloadError {
    pub fn should_retry_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
    }

    /// Whether the attempt wrapper may run the whole download again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled | Self::RangeMap(_) | Self::InvalidHeader(_) => false,
            Self::Status(s) => Self::should_retry_status(*s),
            Self::Http(e) => match e.status() {
                Some(s) => Self::should_retry_status(s),
                None => true,
            },
            _ => true,
        }
    }

    /// Plain cancellation carries less information than whatever caused it.
    pub(crate) fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
