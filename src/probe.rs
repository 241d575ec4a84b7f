//! Probe executor - issues one HTTP request per target
//!
//! ## Key Features
//!
//! 1. **Concurrent fan-out** - all targets are probed at once (optionally capped)
//! 2. **Bounded** - a per-target timeout and an optional whole-run deadline
//! 3. **Phase timings** - DNS lookup, TCP connect, time to first byte, total
//! 4. **Pinned resolution** - the address that was looked up (or the
//!    configured override) is the one the request goes to, Host/SNI unchanged
//!
//! ## Flow per target
//!
//! ```text
//! resolve host → TCP connect (timed) → request → headers (TTFB) → body → Observation
//!      │               │                  │                         │
//!      └── dns ────────┴── connect ───────┴── timeout/tls/request ──┴── body   (failed Observation)
//! ```
//!
//! Transport failures never escape as errors; they become failed
//! observations carrying a [`ProbeErrorCode`].

use std::error::Error as StdError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect;
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tracing::{debug, instrument, trace, warn};

use crate::config::ProbeConfig;
use crate::observation::{Observation, ProbeErrorCode, format_datetime};
use crate::target::Target;

/// A probe that ended without a usable response
#[derive(Debug)]
struct ProbeFailure {
    code: ProbeErrorCode,
    message: String,
}

impl ProbeFailure {
    fn new(code: ProbeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ProbeFailure {
    fn from(err: reqwest::Error) -> Self {
        let message = error_chain(&err);

        let code = if err.is_timeout() {
            ProbeErrorCode::Timeout
        } else if err.is_redirect() {
            ProbeErrorCode::Redirect
        } else if is_tls_failure(&message) {
            ProbeErrorCode::Tls
        } else if err.is_connect() {
            ProbeErrorCode::Connect
        } else if err.is_body() || err.is_decode() {
            ProbeErrorCode::Body
        } else {
            ProbeErrorCode::Request
        };

        Self { code, message }
    }
}

/// Render an error with all of its sources
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn is_tls_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("certificate") || message.contains("tls") || message.contains("handshake")
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Try each address in turn and return the first that accepts a connection,
/// together with the duration of that handshake
async fn handshake(addrs: &[SocketAddr]) -> Result<(SocketAddr, f64), ProbeFailure> {
    let mut failures = Vec::with_capacity(addrs.len());

    for &addr in addrs {
        let start = Instant::now();
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let elapsed = millis(start.elapsed());
                drop(stream);
                return Ok((addr, elapsed));
            }
            Err(e) => {
                trace!("connect to {addr} failed: {e}");
                failures.push(format!("{addr}: {e}"));
            }
        }
    }

    Err(ProbeFailure::new(ProbeErrorCode::Connect, failures.join(", ")))
}

/// Timings and address gathered before the HTTP exchange
#[derive(Debug, Clone, Copy)]
struct Connection {
    addr: SocketAddr,
    namelookup_time: f64,
    connect_time: f64,
}

/// Issues probes for a batch of targets
#[derive(Debug, Clone)]
pub struct ProbeExecutor {
    settings: ProbeConfig,
}

impl ProbeExecutor {
    pub fn new(settings: ProbeConfig) -> Self {
        Self { settings }
    }

    /// Probe every target, returning one observation per target in input order
    pub async fn probe_all(&self, targets: &[Target]) -> Vec<Observation> {
        self.run_batch(targets, None).await
    }

    /// Like [`probe_all`](Self::probe_all), but stops waiting once
    /// `run_timeout` has elapsed
    ///
    /// Probes still in flight at the deadline are dropped and reported as
    /// failed observations with [`ProbeErrorCode::Cancelled`].
    pub async fn probe_all_within(&self, targets: &[Target], run_timeout: Duration) -> Vec<Observation> {
        let deadline = tokio::time::Instant::now() + run_timeout;
        self.run_batch(targets, Some(deadline)).await
    }

    async fn run_batch(
        &self,
        targets: &[Target],
        deadline: Option<tokio::time::Instant>,
    ) -> Vec<Observation> {
        let started = Utc::now();
        let limit = self
            .settings
            .concurrency
            .unwrap_or(targets.len())
            .max(1);

        debug!("probing {} targets ({limit} at a time)", targets.len());

        let mut results: Vec<Option<Observation>> = vec![None; targets.len()];
        let executor = self;
        let mut probes = stream::iter(targets.iter().enumerate())
            .map(move |(index, target)| async move { (index, executor.probe(target).await) })
            .buffer_unordered(limit);

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, probes.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!("run deadline reached, cancelling outstanding probes");
                        break;
                    }
                },
                None => probes.next().await,
            };

            match next {
                Some((index, observation)) => results[index] = Some(observation),
                None => break,
            }
        }

        // dropping the stream cancels whatever is still in flight
        drop(probes);

        results
            .into_iter()
            .zip(targets)
            .map(|(result, target)| {
                result.unwrap_or_else(|| {
                    let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
                    Observation::failed(
                        target,
                        started,
                        ProbeErrorCode::Cancelled,
                        "run deadline reached before the probe finished",
                        millis(elapsed),
                    )
                })
            })
            .collect()
    }

    /// Probe a single target
    ///
    /// Never fails: transport errors and timeouts are reported in the
    /// returned observation.
    #[instrument(skip_all, fields(site = %target.name))]
    pub async fn probe(&self, target: &Target) -> Observation {
        trace!("probing {}", target.url);

        let timestamp = Utc::now();
        let start = Instant::now();
        let timeout = self.settings.timeout();

        let observation = match tokio::time::timeout(timeout, self.execute(target, timestamp, start)).await {
            Ok(Ok(observation)) => observation,
            Ok(Err(failure)) => Observation::failed(
                target,
                timestamp,
                failure.code,
                failure.message,
                millis(start.elapsed()),
            ),
            Err(_) => Observation::failed(
                target,
                timestamp,
                ProbeErrorCode::Timeout,
                format!("no response within {}s", timeout.as_secs_f64()),
                millis(start.elapsed()),
            ),
        };

        match &observation.error_code {
            Some(code) => warn!(
                "probe failed ({code}): {}",
                observation.error.as_deref().unwrap_or_default()
            ),
            None => debug!(
                "HTTP {} in {:.0}ms ({} bytes)",
                observation.http_code, observation.response_time, observation.size_download
            ),
        }

        observation
    }

    async fn execute(
        &self,
        target: &Target,
        timestamp: DateTime<Utc>,
        start: Instant,
    ) -> Result<Observation, ProbeFailure> {
        let host = target
            .url
            .host_str()
            .ok_or_else(|| ProbeFailure::new(ProbeErrorCode::Request, "url has no host"))?;
        let port = target.url.port_or_known_default().unwrap_or(80);

        let connection = self.connect(target, host, port).await?;
        let redirects = Arc::new(AtomicU32::new(0));
        let client = self.client(target, host, connection.addr, redirects.clone())?;

        let mut request = client.get(target.url.clone());
        if let Some(auth) = &target.auth {
            request = request.basic_auth(&auth.username, auth.password.as_ref());
        }

        let request_start = Instant::now();
        let response = request.send().await?;
        let starttransfer_time = millis(request_start.elapsed());

        // headers are collected before the body consumes the response
        let http_code = response.status().as_u16();
        let url = response.url().to_string();
        let primary_ip = response
            .remote_addr()
            .map(|addr| addr.ip())
            .unwrap_or(connection.addr.ip())
            .to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = response.bytes().await?;
        let response_time = connection.namelookup_time + millis(request_start.elapsed());

        let content_check = target
            .content_check
            .as_deref()
            .map(|needle| String::from_utf8_lossy(&body).contains(needle));

        let success = http_code == target.expected_status;
        let error = (!success)
            .then(|| format!("expected HTTP {}, got {http_code}", target.expected_status));

        trace!(
            "total {:.1}ms (dns {:.1}ms, connect {:.1}ms, ttfb {:.1}ms, wall {:.1}ms)",
            response_time,
            connection.namelookup_time,
            connection.connect_time,
            starttransfer_time,
            millis(start.elapsed())
        );

        Ok(Observation {
            timestamp,
            datetime: format_datetime(timestamp),
            url,
            site_name: target.name.clone(),
            success,
            response_time,
            http_code,
            size_download: body.len() as u64,
            primary_ip,
            content_type,
            namelookup_time: connection.namelookup_time,
            connect_time: connection.connect_time,
            starttransfer_time,
            redirect_count: redirects.load(Ordering::Relaxed),
            content_hash: Some(hex::encode(Sha256::digest(&body))),
            content_check,
            error_code: None,
            error,
        })
    }

    /// Resolve the target's addresses and time a TCP handshake to the first
    /// one that accepts
    async fn connect(&self, target: &Target, host: &str, port: u16) -> Result<Connection, ProbeFailure> {
        let lookup_start = Instant::now();

        let addrs: Vec<SocketAddr> = match target.ip {
            Some(ip) => vec![SocketAddr::new(ip, port)],
            None => match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
                Ok(ip) => vec![SocketAddr::new(ip, port)],
                Err(_) => tokio::net::lookup_host((host, port))
                    .await
                    .map_err(|e| ProbeFailure::new(ProbeErrorCode::Dns, format!("{host}: {e}")))?
                    .collect(),
            },
        };
        if addrs.is_empty() {
            return Err(ProbeFailure::new(
                ProbeErrorCode::Dns,
                format!("{host}: no addresses found"),
            ));
        }
        let namelookup_time = if target.ip.is_some() {
            0.0
        } else {
            millis(lookup_start.elapsed())
        };

        let (addr, connect_time) = handshake(&addrs).await?;

        Ok(Connection {
            addr,
            namelookup_time,
            connect_time,
        })
    }

    /// Build a client for one target with its resolution pinned to `addr`
    fn client(
        &self,
        target: &Target,
        host: &str,
        addr: SocketAddr,
        redirects: Arc<AtomicU32>,
    ) -> Result<reqwest::Client, ProbeFailure> {
        let max_redirects = self.settings.max_redirects;
        let policy = redirect::Policy::custom(move |attempt| {
            let previous = attempt.previous().len();
            if previous > max_redirects {
                attempt.error(format!("more than {max_redirects} redirects"))
            } else {
                redirects.store(previous as u32, Ordering::Relaxed);
                attempt.follow()
            }
        });

        let mut builder = reqwest::Client::builder()
            .redirect(policy)
            .timeout(self.settings.timeout())
            .user_agent(&self.settings.user_agent)
            .danger_accept_invalid_certs(!target.verify_tls);

        if host.parse::<IpAddr>().is_err() && !host.starts_with('[') {
            builder = builder.resolve(host, addr);
        }

        builder
            .build()
            .map_err(|e| ProbeFailure::new(ProbeErrorCode::Request, error_chain(&e)))
    }
}
