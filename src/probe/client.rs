//! Timed HEAD probe against one segment URL.
//!
//! Uses libcurl because it exposes the per-phase transfer timestamps
//! (name lookup, connect, TLS, pre-transfer, first byte) that the
//! DNS/TCP/SSL/waiting decomposition needs. Each probe uses its own easy
//! handle; nothing is shared between concurrent probes.
//!
//! Failures are terminal for the attempt: there are no retries here.

use std::collections::BTreeMap;
use std::time::Duration;

use curl::easy::{Easy, List};

use super::timing::{PhaseMarks, PhaseTimings};
use crate::config::MeasureConfig;
use crate::error::{ProbeError, TransportKind};

/// Request headers that ask each CDN for verbose cache diagnostics.
///
/// Vendors may ignore them depending on the customer's configuration.
const AKAMAI_PRAGMA: &str = "Pragma: akamai-x-serial-no, akamai-x-cache-remote-on, \
    akamai-x-request-trace, akamai-x-get-cache-key, akamai-x-meta-trace, \
    akamai-x-get-ssl-client-session-id, akamai-x-get-extracted-values, akamai-x-get-nonces, \
    akamai-x-check-cacheable, akamai-x-get-true-cache-key, akamai-x-get-request-id, \
    akamai-x-cache-on";
const EDGIO_DEBUG: &str =
    "X-EC-Debug: x-ec-cache, x-ec-check-cacheable, x-ec-cache-key, x-ec-cache-state";
const FASTLY_DEBUG: [&str; 4] = [
    "Fastly-Debug: 1",
    "Fastly-Debug-Path: 1",
    "Fastly-Debug-TTL: 1",
    "Fastly-Debug-Digest: 1",
];

pub fn debug_headers() -> Vec<&'static str> {
    let mut headers = vec![AKAMAI_PRAGMA, EDGIO_DEBUG];
    headers.extend(FASTLY_DEBUG);
    headers
}

pub fn is_valid_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
}

impl From<&MeasureConfig> for ProbeOptions {
    fn from(config: &MeasureConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout,
            total_timeout: config.total_timeout,
        }
    }
}

/// One segment to probe, optionally restricted to a byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub url: String,
    /// `bytes=0-500` or a full `Range: bytes=0-500` header line.
    pub range: Option<String>,
}

impl ProbeRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range: None,
        }
    }

    /// Byte span handed to libcurl (`0-500`), which adds the `Range` header itself.
    pub fn byte_span(&self) -> Option<&str> {
        let range = self.range.as_deref()?.trim();
        let range = match range.split_once(':') {
            Some((name, value)) if name.trim().eq_ignore_ascii_case("range") => value.trim(),
            _ => range,
        };
        let span = range.strip_prefix("bytes=").unwrap_or(range).trim();
        (!span.is_empty()).then_some(span)
    }

    /// URL plus range expression, as recorded in the `url` column.
    pub fn label(&self) -> String {
        match self.range.as_deref() {
            Some(r) if !r.trim().is_empty() => format!("{} {}", self.url, r.trim()),
            _ => self.url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub peer_ip: String,
    pub status: u32,
    /// Response headers keyed by lower-case name. Later values win
    /// (repeated headers, redirect hops).
    pub headers: BTreeMap<String, String>,
    pub timing: PhaseTimings,
}

/// Perform one HEAD request and decompose its timing. Blocking.
pub fn probe(request: &ProbeRequest, options: &ProbeOptions) -> Result<ProbeResponse, ProbeError> {
    if !is_valid_url(&request.url) {
        return Err(ProbeError::InvalidUrl(request.url.clone()));
    }

    let setup_err = |e: curl::Error| ProbeError::Setup {
        url: request.url.clone(),
        message: e.to_string(),
    };

    let mut easy = Easy::new();
    configure(&mut easy, request, options).map_err(setup_err)?;

    let mut headers = BTreeMap::new();
    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|line| {
                if let Some((name, value)) = parse_header_line(line) {
                    headers.insert(name, value);
                }
                true
            })
            .map_err(setup_err)?;
        transfer
            .perform()
            .map_err(|e| transport_error(&request.url, e))?;
    }

    let info_err = |e: curl::Error| transport_error(&request.url, e);
    let marks = PhaseMarks {
        namelookup: easy.namelookup_time().map_err(info_err)?,
        connect: easy.connect_time().map_err(info_err)?,
        appconnect: easy.appconnect_time().map_err(info_err)?,
        pretransfer: easy.pretransfer_time().map_err(info_err)?,
        starttransfer: easy.starttransfer_time().map_err(info_err)?,
        total: easy.total_time().map_err(info_err)?,
    };
    let status = easy.response_code().map_err(info_err)?;
    let peer_ip = easy
        .primary_ip()
        .map_err(info_err)?
        .unwrap_or_default()
        .to_string();

    Ok(ProbeResponse {
        peer_ip,
        status,
        headers,
        timing: PhaseTimings::from_marks(&marks),
    })
}

fn configure(easy: &mut Easy, request: &ProbeRequest, options: &ProbeOptions) -> Result<(), curl::Error> {
    easy.url(&request.url)?;
    easy.custom_request("HEAD")?;
    easy.nobody(true)?;
    easy.follow_location(true)?;
    easy.connect_timeout(options.connect_timeout)?;
    easy.timeout(options.total_timeout)?;
    easy.useragent(&options.user_agent)?;

    let mut list = List::new();
    for header in debug_headers() {
        list.append(header)?;
    }
    easy.http_headers(list)?;

    if let Some(span) = request.byte_span() {
        tracing::debug!("Using Range bytes={} for {}", span, request.url);
        easy.range(span)?;
    }
    Ok(())
}

/// Split a raw header line into a lower-cased name and its value; status
/// lines and the terminating blank line yield `None`.
fn parse_header_line(line: &[u8]) -> Option<(String, String)> {
    // Header bytes are ISO-8859-1, which maps 1:1 onto the first 256 code points.
    let text: String = line.iter().map(|&b| b as char).collect();
    let (name, value) = text.split_once(':')?;
    let name = name.trim();
    if name.is_empty() || name.contains(' ') {
        return None;
    }
    Some((name.to_ascii_lowercase(), value.trim().to_string()))
}

fn transport_error(url: &str, e: curl::Error) -> ProbeError {
    let kind = if e.is_couldnt_resolve_host() || e.is_couldnt_resolve_proxy() {
        TransportKind::Dns
    } else if e.is_operation_timedout() {
        TransportKind::Timeout
    } else if e.is_couldnt_connect() {
        TransportKind::Connect
    } else if e.is_ssl_connect_error()
        || e.is_peer_failed_verification()
        || e.is_ssl_certproblem()
        || e.is_ssl_cacert()
    {
        TransportKind::Tls
    } else {
        TransportKind::Other
    };

    ProbeError::Transport {
        kind,
        url: url.to_string(),
        message: e.to_string(),
    }
}
