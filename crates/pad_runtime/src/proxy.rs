//! The reporting proxy agent.
//!
//! At most one agent exists per process. It is created the first time a request carries
//! `APOLLO_ENGINE_KEY` in its tenant context and lives until the process exits. Every request
//! after that routes through it, whether or not it carries the key itself.
//!
//! Startup runs in the background. The request that triggers it never waits, and a failed
//! startup only disables reporting.

use crate::error::{PadError, PadResult};
use crate::tenant::{TenantContext, ENGINE_KEY, ORIGIN_URL_KEY};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

/// Shortest accepted flush interval.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Reporting configuration of the proxy agent.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Endpoint that receives report batches. Batches are logged when unset.
    pub reporting_endpoint: Option<String>,
    /// Log every report at debug level.
    pub debug_reports: bool,
    /// Maximum time a report waits before its batch is shipped.
    pub flush_interval: Duration,
    /// Maximum number of reports per batch.
    pub max_batch: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self {
            reporting_endpoint: None,
            debug_reports: true,
            flush_interval: Duration::from_secs(5),
            max_batch: 16,
        }
    }

    pub fn reporting_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.reporting_endpoint = Some(endpoint.into());
        self
    }

    pub fn debug_reports(mut self, enabled: bool) -> Self {
        self.debug_reports = enabled;
        self
    }

    /// Sets the flush interval, raised to [`MIN_FLUSH_INTERVAL`] if shorter.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval.max(MIN_FLUSH_INTERVAL);
        self
    }

    /// Sets the batch size. Zero is treated as one.
    pub fn max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }
}

/// What the agent records for one routed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceReport {
    pub operation_name: Option<String>,
    pub query: String,
    pub status: u16,
    pub has_errors: bool,
    pub start_time: DateTime<Utc>,
    /// Nanoseconds.
    pub duration: u64,
    /// The `tracing` extension of the response, when execution ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing: Option<serde_json::Value>,
}

/// A batch of reports for one origin.
#[derive(Debug, Clone, Serialize)]
pub struct ReportBatch {
    pub origin: String,
    pub reports: Vec<TraceReport>,
}

/// Destination for report batches.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn ship(&self, batch: &ReportBatch) -> PadResult<()>;
}

/// Writes batch summaries to the log.
#[derive(Debug, Default)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn ship(&self, batch: &ReportBatch) -> PadResult<()> {
        let errored = batch.reports.iter().filter(|r| r.has_errors).count();
        info!(
            origin = %batch.origin,
            reports = batch.reports.len(),
            errored,
            "trace report batch"
        );
        Ok(())
    }
}

/// POSTs batches as JSON to a reporting endpoint.
#[derive(Debug)]
pub struct HttpReportSink {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
}

impl HttpReportSink {
    pub fn new(endpoint: &str, api_key: impl Into<String>) -> PadResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| PadError::report(format!("Invalid reporting endpoint: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PadError::report(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl ReportSink for HttpReportSink {
    async fn ship(&self, batch: &ReportBatch) -> PadResult<()> {
        self.client
            .post(self.endpoint.clone())
            .header("X-Api-Key", &self.api_key)
            .json(batch)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| PadError::report(e.to_string()))?;
        Ok(())
    }
}

/// Lifecycle of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Starting,
    Running,
    Failed,
}

/// A started reporting agent.
#[derive(Debug)]
pub struct ProxyAgent {
    origin: String,
    state: Arc<Mutex<AgentState>>,
    reports: UnboundedSender<TraceReport>,
    recorded: AtomicUsize,
}

impl ProxyAgent {
    /// Creates the agent and starts it in the background.
    ///
    /// Reports recorded before startup finishes are queued.
    fn start(
        origin: String,
        api_key: String,
        config: ProxyConfig,
        sink: Option<Arc<dyn ReportSink>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(AgentState::Starting));

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_agent(
                    origin.clone(),
                    api_key,
                    config,
                    sink,
                    state.clone(),
                    rx,
                ));
            }
            Err(e) => {
                warn!(error = %e, "proxy agent needs a tokio runtime; reporting disabled");
                set_state(&state, AgentState::Failed);
            }
        }

        Self {
            origin,
            state,
            reports: tx,
            recorded: AtomicUsize::new(0),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queues a report. Dropped silently once the agent has failed.
    pub fn record(&self, report: TraceReport) {
        if self.state() == AgentState::Failed {
            return;
        }
        if self.reports.send(report).is_ok() {
            self.recorded.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Number of reports accepted by the agent.
    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::SeqCst)
    }
}

fn set_state(state: &Mutex<AgentState>, next: AgentState) {
    *state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = next;
}

fn build_sink(
    origin: &str,
    api_key: String,
    config: &ProxyConfig,
    sink: Option<Arc<dyn ReportSink>>,
) -> PadResult<Arc<dyn ReportSink>> {
    Url::parse(origin)
        .map_err(|e| PadError::report(format!("Invalid origin URL {:?}: {}", origin, e)))?;

    if let Some(sink) = sink {
        return Ok(sink);
    }
    match &config.reporting_endpoint {
        Some(endpoint) => Ok(Arc::new(HttpReportSink::new(endpoint, api_key)?)),
        None => Ok(Arc::new(LogReportSink)),
    }
}

async fn run_agent(
    origin: String,
    api_key: String,
    config: ProxyConfig,
    sink: Option<Arc<dyn ReportSink>>,
    state: Arc<Mutex<AgentState>>,
    mut rx: UnboundedReceiver<TraceReport>,
) {
    let sink = match build_sink(&origin, api_key, &config, sink) {
        Ok(sink) => sink,
        Err(e) => {
            warn!(origin = %origin, error = %e.message, "proxy agent failed to start; reporting disabled");
            set_state(&state, AgentState::Failed);
            return;
        }
    };

    set_state(&state, AgentState::Running);
    info!(origin = %origin, "proxy agent started");

    let mut ticker = interval(config.flush_interval.max(MIN_FLUSH_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let max_batch = config.max_batch.max(1);
    let mut pending = Vec::with_capacity(max_batch);
    loop {
        tokio::select! {
            report = rx.recv() => match report {
                Some(report) => {
                    if config.debug_reports {
                        debug!(
                            operation = report.operation_name.as_deref().unwrap_or("<anonymous>"),
                            status = report.status,
                            duration_ns = report.duration,
                            "trace report"
                        );
                    }
                    pending.push(report);
                    if pending.len() >= max_batch {
                        flush(sink.as_ref(), &origin, &mut pending).await;
                    }
                }
                None => {
                    flush(sink.as_ref(), &origin, &mut pending).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                flush(sink.as_ref(), &origin, &mut pending).await;
            }
        }
    }
}

async fn flush(sink: &dyn ReportSink, origin: &str, pending: &mut Vec<TraceReport>) {
    if pending.is_empty() {
        return;
    }
    let batch = ReportBatch {
        origin: origin.to_string(),
        reports: std::mem::take(pending),
    };
    if let Err(e) = sink.ship(&batch).await {
        warn!(reports = batch.reports.len(), error = %e.message, "dropping trace report batch");
    }
}

/// Owns the process-wide agent slot.
pub struct ProxyAgentManager {
    config: ProxyConfig,
    sink: Option<Arc<dyn ReportSink>>,
    agent: OnceLock<Arc<ProxyAgent>>,
    starts: AtomicUsize,
}

impl ProxyAgentManager {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            sink: None,
            agent: OnceLock::new(),
            starts: AtomicUsize::new(0),
        }
    }

    /// Ships reports to `sink` instead of the configured destination.
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Returns the agent, starting it if this request carries the credential.
    ///
    /// The origin is the tenant `url` entry, else `fallback_origin`. Without either the agent
    /// is not started and a later request may start it.
    pub fn ensure_started(
        &self,
        tenant: &TenantContext,
        fallback_origin: Option<&str>,
    ) -> Option<Arc<ProxyAgent>> {
        if let Some(agent) = self.agent.get() {
            return Some(agent.clone());
        }

        let api_key = tenant.get_str(ENGINE_KEY)?;
        let Some(origin) = tenant.get_str(ORIGIN_URL_KEY).or(fallback_origin) else {
            debug!("no origin URL for the proxy agent; not starting it");
            return None;
        };

        let agent = self.agent.get_or_init(|| {
            self.starts.fetch_add(1, Ordering::SeqCst);
            info!(origin, "starting proxy agent");
            Arc::new(ProxyAgent::start(
                origin.to_string(),
                api_key.to_string(),
                self.config.clone(),
                self.sink.clone(),
            ))
        });
        Some(agent.clone())
    }

    /// The agent, if one was started.
    pub fn agent(&self) -> Option<Arc<ProxyAgent>> {
        self.agent.get().cloned()
    }

    /// Number of agents constructed. Never exceeds one.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ProxyAgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyAgentManager")
            .field("config", &self.config)
            .field("agent", &self.agent.get())
            .field("starts", &self.start_count())
            .finish()
    }
}
