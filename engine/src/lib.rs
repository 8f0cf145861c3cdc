#![forbid(unsafe_code)]

//! Byte-faithful HTTP wire client.
//!
//! Sends caller-supplied raw request bytes over TCP or TLS and returns the
//! server's response bytes verbatim, alongside structured metadata (status,
//! headers, body, timings, negotiated protocol, peer address). Built for
//! security tooling, fuzzing, and intercepting-proxy use cases where a
//! conventional HTTP client would normalize or reject malformed messages.
//!
//! The caller owns the request bytes end to end: this crate never parses
//! URLs, follows redirects, decompresses bodies, or injects headers.

pub mod error;
pub mod framing;
pub mod options;
pub mod pool;
pub mod response;
pub mod sender;
pub mod stream;

pub use error::{ErrorKind, HttpError, Result};
pub use options::{Options, Scheme};
pub use pool::{ConnectionPool, PooledConnection};
pub use response::{HeaderMap, Response, Timing};
pub use sender::Sender;
