//! Baseline-comparison anomaly detection
//!
//! The [`Detector`] compares a fresh [`Observation`] against the target's
//! expectations and against [`AggregateStats`] computed over its recent
//! history. Every rule is evaluated on every call and all firing rules are
//! reported; deciding what is worth a notification is left to the caller.
//!
//! ```text
//! unreachable            transport error                      → critical
//! status-mismatch        code != expected                     → by status class
//! slow-response          time > avg × multiplier  (≥ n samples) → warning
//! response-time-exceeded time > target limit                  → warning
//! size-deviation         |size - avg| / avg > fraction (≥ n)  → warning
//! content-check-failed   required substring missing           → warning
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::AnomalyThresholds;
use crate::observation::Observation;
use crate::storage::AggregateStats;
use crate::target::Target;

/// How serious an anomaly is, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        })
    }
}

/// Classification of an anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    Unreachable,
    StatusMismatch,
    SlowResponse,
    ResponseTimeExceeded,
    SizeDeviation,
    ContentCheckFailed,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AnomalyKind::Unreachable => "unreachable",
            AnomalyKind::StatusMismatch => "status-mismatch",
            AnomalyKind::SlowResponse => "slow-response",
            AnomalyKind::ResponseTimeExceeded => "response-time-exceeded",
            AnomalyKind::SizeDeviation => "size-deviation",
            AnomalyKind::ContentCheckFailed => "content-check-failed",
        })
    }
}

/// A classified deviation of one observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub message: String,
    pub details: BTreeMap<String, Value>,
}

impl Anomaly {
    fn new(kind: AnomalyKind, severity: Severity, message: String) -> Self {
        Self {
            kind,
            severity,
            message,
            details: BTreeMap::new(),
        }
    }

    fn detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

/// Severity of a response whose status differs from the expected one
pub fn severity_for_status(code: u16) -> Severity {
    match code {
        500.. => Severity::Critical,
        400..=499 => Severity::Error,
        300..=399 => Severity::Info,
        _ => Severity::Warning,
    }
}

/// Stateless rule evaluator
#[derive(Debug, Clone, Default)]
pub struct Detector {
    thresholds: AnomalyThresholds,
}

impl Detector {
    pub fn new(thresholds: AnomalyThresholds) -> Self {
        Self { thresholds }
    }

    /// Evaluate all rules for one observation
    ///
    /// Pure and deterministic: the result depends only on the arguments and
    /// the configured thresholds. A baseline without enough samples turns the
    /// relative rules into no-ops.
    pub fn evaluate(
        &self,
        observation: &Observation,
        target: &Target,
        baseline: &AggregateStats,
    ) -> Vec<Anomaly> {
        let mut anomalies = vec![];

        if !observation.responded() {
            anomalies.push(self.unreachable(observation));
            return anomalies;
        }

        anomalies.extend(self.status_mismatch(observation, target));
        anomalies.extend(self.slow_response(observation, baseline));
        anomalies.extend(self.response_time_exceeded(observation, target));
        anomalies.extend(self.size_deviation(observation, baseline));
        anomalies.extend(self.content_check_failed(observation, target));

        anomalies
    }

    fn unreachable(&self, observation: &Observation) -> Anomaly {
        let code = observation
            .error_code
            .map(|code| code.to_string())
            .unwrap_or_default();
        let reason = observation.error.as_deref().unwrap_or("no response");

        Anomaly::new(
            AnomalyKind::Unreachable,
            Severity::Critical,
            format!("{} is unreachable: {reason}", observation.site_name),
        )
        .detail("error_code", json!(code))
        .detail("error", json!(reason))
        .detail("url", json!(observation.url))
    }

    fn status_mismatch(&self, observation: &Observation, target: &Target) -> Option<Anomaly> {
        if !self.thresholds.status_change || observation.http_code == target.expected_status {
            return None;
        }

        Some(
            Anomaly::new(
                AnomalyKind::StatusMismatch,
                severity_for_status(observation.http_code),
                format!(
                    "{} answered with HTTP {} (expected {})",
                    observation.site_name, observation.http_code, target.expected_status
                ),
            )
            .detail("http_code", json!(observation.http_code))
            .detail("expected_status", json!(target.expected_status)),
        )
    }

    fn slow_response(&self, observation: &Observation, baseline: &AggregateStats) -> Option<Anomaly> {
        if baseline.successful < self.thresholds.min_samples || baseline.avg_response_time <= 0.0 {
            return None;
        }

        let limit = baseline.avg_response_time * self.thresholds.response_time_multiplier;
        if observation.response_time <= limit {
            return None;
        }

        Some(
            Anomaly::new(
                AnomalyKind::SlowResponse,
                Severity::Warning,
                format!(
                    "{} responded in {:.0}ms, {:.1}x its average of {:.0}ms",
                    observation.site_name,
                    observation.response_time,
                    observation.response_time / baseline.avg_response_time,
                    baseline.avg_response_time
                ),
            )
            .detail("response_time", json!(observation.response_time))
            .detail("avg_response_time", json!(baseline.avg_response_time))
            .detail("multiplier", json!(self.thresholds.response_time_multiplier))
            .detail("samples", json!(baseline.successful)),
        )
    }

    fn response_time_exceeded(&self, observation: &Observation, target: &Target) -> Option<Anomaly> {
        let max = target.max_response_time?;
        if observation.response_time <= max as f64 {
            return None;
        }

        Some(
            Anomaly::new(
                AnomalyKind::ResponseTimeExceeded,
                Severity::Warning,
                format!(
                    "{} responded in {:.0}ms, above its limit of {max}ms",
                    observation.site_name, observation.response_time
                ),
            )
            .detail("response_time", json!(observation.response_time))
            .detail("max_response_time", json!(max)),
        )
    }

    fn size_deviation(&self, observation: &Observation, baseline: &AggregateStats) -> Option<Anomaly> {
        if baseline.successful < self.thresholds.min_samples || baseline.avg_size <= 0.0 {
            return None;
        }

        let size = observation.size_download as f64;
        let deviation = (size - baseline.avg_size).abs() / baseline.avg_size;
        if deviation <= self.thresholds.size_difference {
            return None;
        }

        Some(
            Anomaly::new(
                AnomalyKind::SizeDeviation,
                Severity::Warning,
                format!(
                    "{} returned {} bytes, {:.0}% off its average of {:.0} bytes",
                    observation.site_name,
                    observation.size_download,
                    deviation * 100.0,
                    baseline.avg_size
                ),
            )
            .detail("size_download", json!(observation.size_download))
            .detail("avg_size", json!(baseline.avg_size))
            .detail("deviation", json!(deviation))
            .detail("samples", json!(baseline.successful)),
        )
    }

    fn content_check_failed(&self, observation: &Observation, target: &Target) -> Option<Anomaly> {
        let expected = target.content_check.as_deref()?;
        if observation.content_check != Some(false) {
            return None;
        }

        Some(
            Anomaly::new(
                AnomalyKind::ContentCheckFailed,
                Severity::Warning,
                format!(
                    "{} response does not contain '{expected}'",
                    observation.site_name
                ),
            )
            .detail("content_check", json!(expected)),
        )
    }
}
