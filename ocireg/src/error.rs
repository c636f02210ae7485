use reqwest::StatusCode;

pub type Result<T> = std::result::Result<T, Error>;

// one error enum for the whole crate so callers can match on the failure kind
// without digging through wrapper layers. retryable transport faults are
// recovered inside reghttp; everything that reaches the caller is final.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("tag missing")]
    MissingTag,

    #[error("digest missing")]
    MissingDigest,

    #[error("tag or digest missing")]
    MissingTagOrDigest,

    #[error("no authentication challenge available")]
    EmptyChallenge,

    #[error("failed to parse {0}")]
    ParseFailure(String),

    #[error("no new challenge")]
    NoNewChallenge,

    #[error("unauthorized on {0}")]
    HttpUnauthorized(String),

    #[error("not found")]
    NotFound,

    #[error("http status {0}")]
    HttpStatus(StatusCode),

    #[error("rate limit exceeded")]
    RateLimit,

    #[error("retry limit exceeded: {0}")]
    RetryLimitExceeded(Box<Error>),

    #[error("canceled")]
    Canceled,

    #[error("digest mismatch, expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    #[error("short read, expected {expected} bytes, read {read}")]
    ShortRead { expected: u64, read: u64 },

    #[error("unsupported media type {0}")]
    UnsupportedMediaType(String),

    #[error("unsupported api on {0}")]
    UnsupportedApi(String),

    // internal sentinel: a cross-repository mount was declined but the
    // registry opened an upload session at the carried location
    #[error("mount returned upload location")]
    MountReturnedLocation(String),

    #[error("credential helper failed: {0}")]
    CredHelper(String),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    // whether reghttp may recover by failing over or backing off
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            Error::HttpStatus(status) => status.is_server_error(),
            Error::RateLimit | Error::Io(_) => true,
            Error::Reqwest(e) => !e.is_builder() && !e.is_redirect(),
            _ => false,
        }
    }
}
