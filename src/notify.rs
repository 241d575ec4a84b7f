//! Hand-off of anomalies to the outside world
//!
//! The coordinator builds one [`AnomalyReport`] per target with a non-empty
//! anomaly set and passes it to a [`Notifier`]. What a notifier does with it
//! (log it, post it, mail it) is its own business; delivery failures are
//! returned to the coordinator, which logs them and moves on.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::anomaly::{Anomaly, Severity};
use crate::observation::Observation;
use crate::target::Target;

/// Everything a notifier needs to know about one target in one run
#[derive(Debug, Clone)]
pub struct AnomalyReport {
    pub target: Target,
    pub observation: Observation,
    pub anomalies: Vec<Anomaly>,
}

impl AnomalyReport {
    /// Most severe anomaly level in the report
    pub fn severity(&self) -> Option<Severity> {
        self.anomalies.iter().map(|anomaly| anomaly.severity).max()
    }

    /// One-line-per-anomaly text summary
    pub fn message(&self) -> String {
        let mut lines = vec![format!(
            "{} **{}** ({})",
            severity_emoji(self.severity()),
            self.target.name,
            self.target.url
        )];
        lines.extend(
            self.anomalies
                .iter()
                .map(|anomaly| format!("[{}] {}", anomaly.severity, anomaly.message)),
        );
        lines.join("\n")
    }
}

fn severity_emoji(severity: Option<Severity>) -> &'static str {
    match severity {
        Some(Severity::Critical) => "🔴",
        Some(Severity::Error) => "🟠",
        Some(Severity::Warning) => "⚠️",
        Some(Severity::Info) | None => "ℹ️",
    }
}

/// Receiver of anomaly reports
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, report: &AnomalyReport) -> anyhow::Result<()>;
}

/// Notifier that only writes reports to the log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, report: &AnomalyReport) -> anyhow::Result<()> {
        for anomaly in &report.anomalies {
            match anomaly.severity {
                Severity::Critical | Severity::Error => error!(
                    site = %report.target.name,
                    kind = %anomaly.kind,
                    "{}", anomaly.message
                ),
                Severity::Warning => warn!(
                    site = %report.target.name,
                    kind = %anomaly.kind,
                    "{}", anomaly.message
                ),
                Severity::Info => info!(
                    site = %report.target.name,
                    kind = %anomaly.kind,
                    "{}", anomaly.message
                ),
            }
        }
        Ok(())
    }
}

/// Notifier posting each report as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip_all, fields(site = %report.target.name))]
    async fn notify(&self, report: &AnomalyReport) -> anyhow::Result<()> {
        let payload = json!({
            "message": report.message(),
            "site": report.target.name,
            "url": report.target.url.as_str(),
            "severity": report.severity(),
            "notify": report.target.notify,
            "anomalies": report.anomalies,
            "observation": report.observation,
            "timestamp": Utc::now().to_rfc3339()
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("webhook answered with status {}", response.status());
        }

        info!("sent anomaly report via webhook");
        Ok(())
    }
}
