//! Typed failure conditions.
//!
//! Per-row and per-probe failures are recovered locally (skip + log); only
//! [`ProcessError::NoValidData`] and configuration errors end a run.

use thiserror::Error;

use crate::cdn::CacheTrace;

/// Why a single probe produced no result row.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Target is not `http://` or `https://`. Rejected before any network call.
    #[error("invalid URL (expected http:// or https://): {0}")]
    InvalidUrl(String),

    /// DNS, connect, TLS, timeout or protocol failure during the transfer.
    #[error("{kind} error while requesting {url}: {message}")]
    Transport {
        kind: TransportKind,
        url: String,
        message: String,
    },

    /// The request could not be configured (bad header value, range, ...).
    #[error("failed to configure request for {url}: {message}")]
    Setup { url: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Dns,
    Connect,
    Tls,
    Timeout,
    Other,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Dns => "dns",
            TransportKind::Connect => "connect",
            TransportKind::Tls => "tls",
            TransportKind::Timeout => "timeout",
            TransportKind::Other => "transport",
        })
    }
}

/// The stored header payload could not be parsed into a mapping.
#[derive(Debug, Error)]
#[error("undecodable header payload: {0}")]
pub struct HeaderDecodeError(pub String);

/// Why a segment row was excluded from the unified table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Exclusion {
    #[error("response headers could not be decoded")]
    UndecodableHeaders,
    #[error("timing info could not be parsed")]
    MalformedTiming,
    #[error("timestamp could not be parsed")]
    MalformedTimestamp,
    #[error("cache state {0} not accepted for this vendor")]
    Unclassifiable(CacheTrace),
    #[error("no vendor tag and content not in any vendor list")]
    NoVendor,
}

impl Exclusion {
    /// Short label used when tallying exclusions.
    pub fn kind(&self) -> &'static str {
        match self {
            Exclusion::UndecodableHeaders => "undecodable_headers",
            Exclusion::MalformedTiming => "malformed_timing",
            Exclusion::MalformedTimestamp => "malformed_timestamp",
            Exclusion::Unclassifiable(_) => "unclassifiable",
            Exclusion::NoVendor => "no_vendor",
        }
    }
}

/// Terminal processing failures.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no valid data (HTTP 200/206 with a classifiable cache state) found after parsing")]
    NoValidData,
}

/// Per-row failures of the external QoE simulator.
#[derive(Debug, Error)]
pub enum QoeError {
    #[error("failed to launch simulator: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("failed to encode simulator payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("simulator exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("no QoE JSON line found in simulator output")]
    MissingQoeLine,
}
