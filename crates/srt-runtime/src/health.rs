//! Readiness probing
//!
//! Workers register with the frontend on their own schedule. The prober polls
//! the frontend until enough prefill and decode workers are visible, the
//! deadline passes, or the job is cancelled. Two payload shapes are understood:
//!
//! - registry schema (`/health`): `{"instances": [{"endpoint": "generate", "component": "prefill"}]}`
//! - stats schema (`/workers`): `{"stats": {"prefill_count": 1, "decode_count": 2, "regular_count": 0}}`

use crate::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use srt_core::FrontendType;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-request timeout for readiness probes
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Spacing of TCP port checks
pub const PORT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const PORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Snapshot of worker readiness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealthResult {
    pub ready: bool,
    pub message: String,
    pub prefill_ready: u32,
    pub prefill_expected: u32,
    pub decode_ready: u32,
    pub decode_expected: u32,
}

impl WorkerHealthResult {
    fn not_ready(message: String, prefill_expected: u32, decode_expected: u32) -> Self {
        Self {
            ready: false,
            message,
            prefill_ready: 0,
            prefill_expected,
            decode_ready: 0,
            decode_expected,
        }
    }

    fn from_counts(prefill: u32, decode: u32, regular: u32, expected_prefill: u32, expected_decode: u32) -> Self {
        let ready = prefill >= expected_prefill && decode >= expected_decode;
        let mut message = if ready {
            format!("Model is ready. Have {} prefills and {} decodes.", prefill, decode)
        } else {
            format!(
                "Model is not ready, waiting for {} prefills and {} decodes. Have {} prefills and {} decodes.",
                expected_prefill.saturating_sub(prefill),
                expected_decode.saturating_sub(decode),
                prefill,
                decode
            )
        };
        if regular > 0 {
            message.push_str(&format!(" ({} regular workers)", regular));
        }
        Self {
            ready,
            message,
            prefill_ready: prefill,
            prefill_expected: expected_prefill,
            decode_ready: decode,
            decode_expected: expected_decode,
        }
    }
}

impl fmt::Display for WorkerHealthResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Readiness payload shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSchema {
    /// Self-registered instance list
    Registry,
    /// Aggregate per-role counts
    Stats,
}

impl HealthSchema {
    /// Path of the readiness endpoint
    pub fn path(&self) -> &'static str {
        match self {
            HealthSchema::Registry => "/health",
            HealthSchema::Stats => "/workers",
        }
    }

    /// Interpret a payload against expected counts
    pub fn parse(&self, payload: &Value, expected_prefill: u32, expected_decode: u32) -> WorkerHealthResult {
        match self {
            HealthSchema::Registry => parse_registry_health(payload, expected_prefill, expected_decode),
            HealthSchema::Stats => parse_stats_health(payload, expected_prefill, expected_decode),
        }
    }
}

impl From<FrontendType> for HealthSchema {
    fn from(frontend: FrontendType) -> Self {
        match frontend {
            FrontendType::Dynamo => HealthSchema::Registry,
            FrontendType::Sglang => HealthSchema::Stats,
        }
    }
}

/// Count `generate` instances by component.
///
/// `backend` instances come from aggregated workers and count as decode.
pub fn parse_registry_health(payload: &Value, expected_prefill: u32, expected_decode: u32) -> WorkerHealthResult {
    let Some(instances) = payload.get("instances") else {
        return WorkerHealthResult::not_ready(
            format!("Key 'instances' not found in response: {}", payload),
            expected_prefill,
            expected_decode,
        );
    };

    let mut prefill = 0u32;
    let mut decode = 0u32;
    for instance in instances.as_array().map(Vec::as_slice).unwrap_or_default() {
        if instance.get("endpoint").and_then(Value::as_str) != Some("generate") {
            continue;
        }
        match instance.get("component").and_then(Value::as_str) {
            Some("prefill") => prefill += 1,
            Some("decode") | Some("backend") => decode += 1,
            _ => {}
        }
    }

    WorkerHealthResult::from_counts(prefill, decode, 0, expected_prefill, expected_decode)
}

/// Read router stats; `regular_count` workers count as decode
pub fn parse_stats_health(payload: &Value, expected_prefill: u32, expected_decode: u32) -> WorkerHealthResult {
    let Some(stats) = payload.get("stats") else {
        return WorkerHealthResult::not_ready(
            format!("Key 'stats' not found in response: {}", payload),
            expected_prefill,
            expected_decode,
        );
    };

    let count = |key: &str| -> u32 {
        stats
            .get(key)
            .and_then(Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0)
    };
    let prefill = count("prefill_count");
    let regular = count("regular_count");
    let decode = count("decode_count").saturating_add(regular);

    WorkerHealthResult::from_counts(prefill, decode, regular, expected_prefill, expected_decode)
}

/// How a readiness wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready(WorkerHealthResult),
    /// Deadline passed; carries the last parsed snapshot if any
    TimedOut {
        waited: Duration,
        last: Option<WorkerHealthResult>,
    },
    Cancelled,
}

/// Polls a frontend until the expected workers have registered
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
    url: String,
    schema: HealthSchema,
    interval: Duration,
    timeout: Duration,
    report_every: Duration,
}

impl ReadinessProber {
    /// Create a new prober against `http://host:port`
    pub fn new(host: &str, port: u16, schema: HealthSchema, interval: Duration, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: format!("http://{}:{}{}", host, port, schema.path()),
            schema,
            interval,
            timeout,
            report_every: Duration::from_secs(60),
        })
    }

    /// Minimum spacing of progress and error log lines
    pub fn with_report_every(mut self, report_every: Duration) -> Self {
        self.report_every = report_every;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Probe once; transport and decoding failures are errors
    pub async fn check(&self, expected_prefill: u32, expected_decode: u32) -> Result<WorkerHealthResult> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RuntimeError::Health(format!("{} returned {}", self.url, status)));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| RuntimeError::Health(format!("Invalid payload from {}: {}", self.url, e)))?;
        Ok(self.schema.parse(&payload, expected_prefill, expected_decode))
    }

    /// Poll until ready, timed out, or cancelled
    pub async fn wait_for_model(
        &self,
        expected_prefill: u32,
        expected_decode: u32,
        cancel: &CancellationToken,
    ) -> ReadinessOutcome {
        info!(
            "Polling {} every {:?} for {} prefills and {} decodes",
            self.url, self.interval, expected_prefill, expected_decode
        );

        let started = Instant::now();
        let mut last_report = started;
        let mut last: Option<WorkerHealthResult> = None;

        loop {
            if cancel.is_cancelled() {
                warn!("Wait for model aborted");
                return ReadinessOutcome::Cancelled;
            }
            let waited = started.elapsed();
            if waited >= self.timeout {
                warn!("Model did not get healthy in {:?}", self.timeout);
                return ReadinessOutcome::TimedOut { waited, last };
            }

            // a hung frontend must not delay cancellation
            let checked = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Wait for model aborted");
                    return ReadinessOutcome::Cancelled;
                }
                checked = self.check(expected_prefill, expected_decode) => checked,
            };

            match checked {
                Ok(result) if result.ready => {
                    info!("{}", result.message);
                    return ReadinessOutcome::Ready(result);
                }
                Ok(result) => {
                    if last_report.elapsed() >= self.report_every {
                        info!("{}", result.message);
                        last_report = Instant::now();
                    }
                    last = Some(result);
                }
                Err(e) => {
                    if last_report.elapsed() >= self.report_every {
                        debug!("Health check failed: {}", e);
                        last_report = Instant::now();
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Wait for model aborted");
                    return ReadinessOutcome::Cancelled;
                }
                _ = sleep(self.interval) => {}
            }
        }
    }
}

/// Wait until a TCP port accepts connections
pub async fn wait_for_port(host: &str, port: u16, limit: Duration, cancel: &CancellationToken) -> Result<()> {
    let deadline = Instant::now() + limit;
    let addr = format!("{}:{}", host, port);

    loop {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled(format!("waiting for {}", addr)));
        }

        match timeout(PORT_CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => {
                debug!("{} is accepting connections", addr);
                return Ok(());
            }
            Ok(Err(e)) => debug!("{} not ready: {}", addr, e),
            Err(_) => debug!("{} connect timed out", addr),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(RuntimeError::Timeout(format!("{} not reachable after {:?}", addr, limit)));
        }
        let pause = PORT_POLL_INTERVAL.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RuntimeError::Cancelled(format!("waiting for {}", addr)));
            }
            _ = sleep(pause) => {}
        }
    }
}
