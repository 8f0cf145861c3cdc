use thiserror::Error;

/// Discriminates the failure kinds a caller can branch on without string-matching a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Dns,
    Connection,
    Tls,
    Timeout,
    Protocol,
    Proxy,
    InvalidRequest,
    BodyTooLarge,
}

/// Errors that can occur while sending a raw request over the wire.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response body exceeded the {limit}-byte memory cap")]
    BodyTooLarge { limit: usize },
}

impl HttpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HttpError::Dns(_) => ErrorKind::Dns,
            HttpError::Connection(_) => ErrorKind::Connection,
            HttpError::Tls(_) => ErrorKind::Tls,
            HttpError::Timeout(_) => ErrorKind::Timeout,
            HttpError::Protocol(_) => ErrorKind::Protocol,
            HttpError::Proxy(_) => ErrorKind::Proxy,
            HttpError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            HttpError::BodyTooLarge { .. } => ErrorKind::BodyTooLarge,
        }
    }

    pub fn timeout(op: impl Into<String>) -> Self {
        HttpError::Timeout(op.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        HttpError::Tls(msg.into())
    }

    pub fn proxy(msg: impl Into<String>) -> Self {
        HttpError::Proxy(msg.into())
    }

    pub fn dns(msg: impl Into<String>) -> Self {
        HttpError::Dns(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, HttpError>;
