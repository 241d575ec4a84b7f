//! Target descriptors
//!
//! A [`Target`] is the validated, read-only description of one monitored
//! endpoint. It is produced once per run by [`crate::config::Config::targets`]
//! and shared by the probe, storage and detection stages.

use std::net::IpAddr;

use reqwest::Url;
use serde::{Deserialize, Serialize};

/// HTTP status a target is expected to answer with when nothing is configured
pub const DEFAULT_EXPECTED_STATUS: u16 = 200;

/// Basic-auth credentials sent with every probe of a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

/// One monitored HTTP(S) endpoint and its expectations
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Unique display name (also the source of the storage namespace)
    pub name: String,

    /// URL to request
    pub url: Url,

    /// Status code that counts as success
    pub expected_status: u16,

    /// Absolute response-time limit in milliseconds
    pub max_response_time: Option<u64>,

    /// Substring the response body must contain
    pub content_check: Option<String>,

    /// Fixed address the host resolves to (bypasses DNS)
    pub ip: Option<IpAddr>,

    /// Optional basic-auth credentials
    pub auth: Option<Credentials>,

    /// Verify TLS certificates
    pub verify_tls: bool,

    /// Notification addresses (always a list, possibly empty)
    pub notify: Vec<String>,
}

impl Target {
    /// Create a target with defaults for every optional field
    pub fn new(name: impl Into<String>, url: Url) -> Self {
        Self {
            name: name.into(),
            url,
            expected_status: DEFAULT_EXPECTED_STATUS,
            max_response_time: None,
            content_check: None,
            ip: None,
            auth: None,
            verify_tls: true,
            notify: vec![],
        }
    }

    /// Storage namespace of this target
    pub fn namespace(&self) -> String {
        canonical_name(&self.name)
    }
}

/// Canonicalize a target name into a storage namespace key
///
/// Lowercases the name and replaces every character that is not an ASCII
/// letter or digit with `_`. Different raw names may map to the same key
/// (`"Site A"` and `"site-a"`); such targets share one namespace.
pub fn canonical_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
