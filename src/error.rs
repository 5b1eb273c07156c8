use thiserror::Error;

pub type DeviceResult<T> = std::result::Result<T, Error>;

/// Failures raised while talking to the boiler controller.
///
/// `Http` and `Network` describe a single failed attempt and are retried by
/// the client; once the retry budget is spent the last one is wrapped in
/// `RetriesExhausted`. `Authentication` and `Protocol` are never retried.
#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication rejected by device (HTTP {status})")]
    Authentication { status: u16 },

    #[error("device returned HTTP {status}")]
    Http { status: u16 },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("giving up after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("malformed register response: {0}")]
    Protocol(String),

    #[error("device info probe returned {got} of {expected} registers")]
    Setup { expected: usize, got: usize },

    #[error("update failed: {0}")]
    UpdateFailed(#[source] Box<Error>),

    #[error("invalid request url: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    pub fn is_authentication(&self) -> bool {
        match self {
            Error::Authentication { .. } => true,
            Error::UpdateFailed(inner) => inner.is_authentication(),
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http { .. } | Error::Network(_) | Error::RetriesExhausted { .. } => true,
            Error::UpdateFailed(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// Short label for logs, stats and the MQTT error topic.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Authentication { .. } => "authentication",
            Error::Http { .. } | Error::Network(_) | Error::RetriesExhausted { .. } => "network",
            Error::Protocol(_) => "protocol",
            Error::Setup { .. } => "setup",
            Error::UpdateFailed(inner) => inner.kind(),
            Error::Url(_) => "url",
        }
    }
}
