//! Prometheus metrics for the engine
//!
//! # Available Metrics
//!
//! - `flowplane_flows_submitted_total` - Counter of accepted submissions
//! - `flowplane_flows_finished_total{status}` - Counter of flows reaching a terminal state
//! - `flowplane_task_attempts_total{outcome}` - Counter of task attempts
//! - `flowplane_recovery_actions_total{kind, action}` - Counter of recovery decisions
//! - `flowplane_task_duration_seconds` - Histogram of task attempt durations
//! - `flowplane_dispatched_flows` - Gauge of flows counted against the concurrency cap
//! - `flowplane_pending_flows` - Gauge of Queued + Ready flows
//! - `flowplane_system_load_percent` - Gauge of reserved / total ledger capacity
//!
//! Each [`EngineMetrics`] owns a private registry, so several orchestrators
//! can live in one process (tests do this).

use crate::error::Result;
use crate::models::FlowStatus;
use crate::recovery::{FailureKind, RecoveryAction};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Histogram bucket boundaries for task duration metrics (in seconds)
const TASK_DURATION_BUCKETS: &[f64] = &[0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Engine metrics registry
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Arc<Registry>,
    flows_submitted: Counter,
    flows_finished: CounterVec,
    task_attempts: CounterVec,
    recovery_actions: CounterVec,
    task_duration: Histogram,
    dispatched_flows: IntGauge,
    pending_flows: IntGauge,
    system_load: Gauge,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let flows_submitted = Counter::with_opts(Opts::new(
            "flowplane_flows_submitted_total",
            "Total number of accepted flow submissions",
        ))?;
        let flows_finished = CounterVec::new(
            Opts::new(
                "flowplane_flows_finished_total",
                "Total number of flows reaching a terminal state",
            ),
            &["status"],
        )?;
        let task_attempts = CounterVec::new(
            Opts::new(
                "flowplane_task_attempts_total",
                "Total number of task attempts",
            ),
            &["outcome"],
        )?;
        let recovery_actions = CounterVec::new(
            Opts::new(
                "flowplane_recovery_actions_total",
                "Recovery decisions by failure kind and action",
            ),
            &["kind", "action"],
        )?;
        let task_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flowplane_task_duration_seconds",
                "Task attempt duration in seconds",
            )
            .buckets(TASK_DURATION_BUCKETS.to_vec()),
        )?;
        let dispatched_flows = IntGauge::with_opts(Opts::new(
            "flowplane_dispatched_flows",
            "Flows counted against max_concurrent_flows",
        ))?;
        let pending_flows = IntGauge::with_opts(Opts::new(
            "flowplane_pending_flows",
            "Flows waiting in Queued or Ready",
        ))?;
        let system_load = Gauge::with_opts(Opts::new(
            "flowplane_system_load_percent",
            "Reserved share of total ledger capacity",
        ))?;

        registry.register(Box::new(flows_submitted.clone()))?;
        registry.register(Box::new(flows_finished.clone()))?;
        registry.register(Box::new(task_attempts.clone()))?;
        registry.register(Box::new(recovery_actions.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(dispatched_flows.clone()))?;
        registry.register(Box::new(pending_flows.clone()))?;
        registry.register(Box::new(system_load.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            flows_submitted,
            flows_finished,
            task_attempts,
            recovery_actions,
            task_duration,
            dispatched_flows,
            pending_flows,
            system_load,
        })
    }

    pub fn record_submitted(&self) {
        self.flows_submitted.inc();
    }

    pub fn record_finished(&self, status: FlowStatus) {
        self.flows_finished
            .with_label_values(&[status.to_string().as_str()])
            .inc();
    }

    /// `outcome` is "success", "failure" or "cancelled"
    pub fn record_task_attempt(&self, outcome: &str, duration: Duration) {
        self.task_attempts.with_label_values(&[outcome]).inc();
        self.task_duration.observe(duration.as_secs_f64());
    }

    pub fn record_recovery(&self, kind: FailureKind, action: &RecoveryAction) {
        self.recovery_actions
            .with_label_values(&[kind.as_str(), action.label()])
            .inc();
    }

    pub fn set_queue_state(&self, pending: usize, dispatched: usize, load_percent: f64) {
        self.pending_flows.set(pending as i64);
        self.dispatched_flows.set(dispatched as i64);
        self.system_load.set(load_percent);
    }

    pub fn flows_submitted(&self) -> u64 {
        self.flows_submitted.get() as u64
    }

    pub fn flows_finished(&self, status: FlowStatus) -> u64 {
        self.flows_finished
            .with_label_values(&[status.to_string().as_str()])
            .get() as u64
    }

    pub fn task_attempts(&self, outcome: &str) -> u64 {
        self.task_attempts.with_label_values(&[outcome]).get() as u64
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Serve `GET /metrics` on 127.0.0.1:`port` until the returned task is aborted
    pub async fn serve(&self, port: u16) -> Result<JoinHandle<()>> {
        let addr = format!("127.0.0.1:{port}");
        let listener = TcpListener::bind(&addr).await?;
        info!("Metrics server listening on http://{}/metrics", addr);

        let metrics = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            if let Err(e) = metrics.handle_request(stream).await {
                                error!("Error handling metrics request: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        }))
    }

    async fn handle_request(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let mut buffer = [0; 1024];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);

        if request.starts_with("GET /metrics") {
            let body = self.encode()?;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await?;
        } else {
            let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found";
            stream.write_all(response.as_bytes()).await?;
        }
        Ok(())
    }
}
