use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use tracing::{trace, warn};

use crate::error::ConfigError;
use crate::target::{Credentials, DEFAULT_EXPECTED_STATUS, Target};

/// Top-level configuration file
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// Root directory of the time-series store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub anomaly: AnomalyThresholds,

    /// Optional webhook receiving anomaly reports
    pub webhook: Option<Webhook>,

    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Run-scoped lock configuration
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_path")]
    pub path: PathBuf,

    /// Age in seconds after which a lock is considered stale
    #[serde(default = "default_lock_max_age")]
    pub max_age: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: default_lock_path(),
            max_age: default_lock_max_age(),
        }
    }
}

impl LockConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age)
    }
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("./sitewatch.lock")
}

fn default_lock_max_age() -> u64 {
    600
}

/// Probe executor configuration
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProbeConfig {
    /// Per-target timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Whole-run probing deadline in seconds
    #[serde(default = "default_run_timeout")]
    pub run_timeout: u64,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Maximum number of probes in flight (unbounded if unset)
    pub concurrency: Option<usize>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            run_timeout: default_run_timeout(),
            max_redirects: default_max_redirects(),
            concurrency: None,
            user_agent: default_user_agent(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout)
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_run_timeout() -> u64 {
    300
}

fn default_max_redirects() -> usize {
    5
}

fn default_user_agent() -> String {
    format!("sitewatch/{}", env!("CARGO_PKG_VERSION"))
}

/// Store maintenance and baseline window configuration
#[derive(Debug, Clone, serde::Deserialize)]
pub struct StorageConfig {
    /// Day logs older than this are deleted
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Day logs older than this are compressed
    #[serde(default = "default_compress_after_days")]
    pub compress_after_days: u32,

    /// Number of days the baseline statistics cover
    #[serde(default = "default_baseline_days")]
    pub baseline_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            compress_after_days: default_compress_after_days(),
            baseline_days: default_baseline_days(),
        }
    }
}

fn default_retention_days() -> u32 {
    90
}

fn default_compress_after_days() -> u32 {
    7
}

fn default_baseline_days() -> u32 {
    7
}

/// Thresholds of the anomaly detector
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct AnomalyThresholds {
    /// Relative slow-response factor against the baseline average
    #[serde(default = "default_response_time_multiplier")]
    pub response_time_multiplier: f64,

    /// Allowed relative deviation from the baseline average size
    #[serde(default = "default_size_difference")]
    pub size_difference: f64,

    /// Report responses with an unexpected status code
    #[serde(default = "default_status_change")]
    pub status_change: bool,

    /// Successful samples the baseline needs before relative rules apply
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            response_time_multiplier: default_response_time_multiplier(),
            size_difference: default_size_difference(),
            status_change: default_status_change(),
            min_samples: default_min_samples(),
        }
    }
}

fn default_response_time_multiplier() -> f64 {
    3.0
}

fn default_size_difference() -> f64 {
    0.5
}

fn default_status_change() -> bool {
    true
}

fn default_min_samples() -> usize {
    10
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Webhook {
    pub url: String,
}

/// One site as written in the configuration file
///
/// `name` and `url` are optional here so that a missing field is reported
/// with the site's position instead of a generic parse error.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SiteConfig {
    pub name: Option<String>,
    pub url: Option<String>,
    pub expected_status: Option<u16>,
    pub max_response_time: Option<u64>,
    pub content_check: Option<String>,
    pub ip: Option<IpAddr>,
    pub auth: Option<Credentials>,
    pub verify_tls: Option<bool>,
    #[serde(default)]
    pub notify: Option<OneOrMany>,
}

/// A value that may be given either once or as a list
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

impl SiteConfig {
    /// Validate this entry and turn it into a [`Target`]
    ///
    /// `index` is the position in the `sites` list, used for error messages.
    pub fn resolve(&self, index: usize) -> Result<Target, ConfigError> {
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(ConfigError::MissingField {
                index,
                field: "name",
            })?;

        let raw_url = self
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingField { index, field: "url" })?;

        let url = Url::parse(raw_url).map_err(|e| ConfigError::InvalidUrl {
            site: name.to_string(),
            url: raw_url.to_string(),
            reason: e.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ConfigError::InvalidUrl {
                site: name.to_string(),
                url: raw_url.to_string(),
                reason: "only http(s) urls with a host are supported".to_string(),
            });
        }

        // a literal host is connected to directly, so an override could never apply
        let literal = url
            .host_str()
            .and_then(|host| host.trim_matches(['[', ']']).parse::<IpAddr>().ok());
        if let Some((literal, ip)) = literal.zip(self.ip).filter(|(literal, ip)| literal != ip) {
            return Err(ConfigError::InvalidUrl {
                site: name.to_string(),
                url: raw_url.to_string(),
                reason: format!("ip override {ip} conflicts with the literal host {literal}"),
            });
        }

        let notify = self
            .notify
            .clone()
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .into_iter()
            .map(|address| address.trim().to_string())
            .filter(|address| !address.is_empty())
            .collect();

        Ok(Target {
            name: name.to_string(),
            url,
            expected_status: self.expected_status.unwrap_or(DEFAULT_EXPECTED_STATUS),
            max_response_time: self.max_response_time,
            content_check: self.content_check.clone().filter(|check| !check.is_empty()),
            ip: self.ip,
            auth: self.auth.clone(),
            verify_tls: self.verify_tls.unwrap_or(true),
            notify,
        })
    }
}

impl Config {
    /// Validate all configured sites and return them as targets, in order
    pub fn targets(&self) -> Result<Vec<Target>, ConfigError> {
        if self.sites.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        let mut targets = Vec::with_capacity(self.sites.len());
        let mut namespaces: HashMap<String, String> = HashMap::new();

        for (index, site) in self.sites.iter().enumerate() {
            let target = site.resolve(index)?;

            if targets.iter().any(|t: &Target| t.name == target.name) {
                return Err(ConfigError::DuplicateName(target.name));
            }

            let namespace = target.namespace();
            if let Some(other) = namespaces.get(&namespace) {
                warn!(
                    "sites '{}' and '{}' share the storage namespace '{namespace}'",
                    other, target.name
                );
            } else {
                namespaces.insert(namespace, target.name.clone());
            }

            targets.push(target);
        }

        Ok(targets)
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    serde_json::from_str(content)
        .map_err(ConfigError::from)
        .inspect(|config| trace!("loaded config: {config:?}"))
}
