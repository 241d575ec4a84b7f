//! Probe results
//!
//! An [`Observation`] is created exactly once by the probe executor and is
//! persisted verbatim by the store. Its serde shape is the on-disk log
//! record, so field names follow the log format rather than Rust naming.

use std::fmt;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::target::Target;

/// Why a probe did not produce a usable response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorCode {
    /// The per-target timeout elapsed
    Timeout,
    /// Host name could not be resolved
    Dns,
    /// TCP connection could not be established
    Connect,
    /// TLS handshake or certificate validation failed
    Tls,
    /// Redirect limit exceeded or invalid redirect
    Redirect,
    /// Any other failure while sending the request
    Request,
    /// Response body could not be read
    Body,
    /// The whole run was cut short before this probe finished
    Cancelled,
}

impl fmt::Display for ProbeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ProbeErrorCode::Timeout => "timeout",
            ProbeErrorCode::Dns => "dns",
            ProbeErrorCode::Connect => "connect",
            ProbeErrorCode::Tls => "tls",
            ProbeErrorCode::Redirect => "redirect",
            ProbeErrorCode::Request => "request",
            ProbeErrorCode::Body => "body",
            ProbeErrorCode::Cancelled => "cancelled",
        };
        f.write_str(code)
    }
}

/// One probe result for one target at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// When the probe started (unix seconds on disk)
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,

    /// Human readable local time of `timestamp`
    pub datetime: String,

    /// Effective URL (after redirects, if any response was received)
    pub url: String,

    /// Target name as configured
    pub site_name: String,

    /// A response arrived and its status equals the expected status
    pub success: bool,

    /// Total time in milliseconds
    pub response_time: f64,

    /// Final HTTP status code, 0 when no response was received
    pub http_code: u16,

    /// Downloaded body size in bytes
    pub size_download: u64,

    /// Address the request was sent to
    #[serde(default)]
    pub primary_ip: String,

    #[serde(default)]
    pub content_type: String,

    /// DNS lookup time in milliseconds
    #[serde(default)]
    pub namelookup_time: f64,

    /// TCP connect time in milliseconds
    #[serde(default)]
    pub connect_time: f64,

    /// Time from sending the request until the response headers arrived
    #[serde(default)]
    pub starttransfer_time: f64,

    #[serde(default)]
    pub redirect_count: u32,

    /// Hex SHA-256 of the response body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    /// Outcome of the configured content check, `None` if not evaluated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_check: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ProbeErrorCode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Observation {
    /// Build a failed observation for a probe that got no usable response
    pub fn failed(
        target: &Target,
        timestamp: DateTime<Utc>,
        code: ProbeErrorCode,
        message: impl Into<String>,
        response_time: f64,
    ) -> Self {
        Self {
            timestamp,
            datetime: format_datetime(timestamp),
            url: target.url.to_string(),
            site_name: target.name.clone(),
            success: false,
            response_time,
            http_code: 0,
            size_download: 0,
            primary_ip: String::new(),
            content_type: String::new(),
            namelookup_time: 0.0,
            connect_time: 0.0,
            starttransfer_time: 0.0,
            redirect_count: 0,
            content_hash: None,
            content_check: None,
            error_code: Some(code),
            error: Some(message.into()),
        }
    }

    /// Whether the server answered at all (no transport error)
    pub fn responded(&self) -> bool {
        self.error_code.is_none()
    }
}

/// Render a timestamp the way it appears in the `datetime` log field
pub fn format_datetime(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
