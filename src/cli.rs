//! CLI interface for flowplane

use crate::backends::shell::ShellBackend;
use crate::backends::TaskBackend;
use crate::config::EngineConfig;
use crate::logging::{init_logging, LogConfig};
use crate::models::{FlowId, FlowResult};
use crate::orchestrator::Orchestrator;
use crate::parser::{parse_flow_file, FlowDocument};
use crate::policy::PolicyKind;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// flowplane - Flow scheduling and execution engine
#[derive(Parser, Debug)]
#[command(name = "flowplane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Flow scheduling and execution engine", long_about = None)]
pub struct Cli {
    /// Engine configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json", global = true)]
    pub log_format: String,

    /// Serve Prometheus metrics on this port while running
    #[arg(long, global = true)]
    pub metrics_port: Option<u16>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit flow files and run them to completion
    Run {
        /// Flow or bundle YAML files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Override the configured scheduling policy
        #[arg(short, long)]
        policy: Option<PolicyKind>,

        /// Give up and cancel remaining flows after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Parse and cycle-check flow files without running them
    Validate {
        /// Flow or bundle YAML files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        let config = LogConfig {
            level: self.log_level.as_str().into(),
            format: self.log_format.as_str().into(),
        };
        init_logging(&config)
    }

    /// Execute the CLI command; returns false if any flow failed
    pub async fn execute(&self) -> anyhow::Result<bool> {
        match &self.command {
            Commands::Run {
                files,
                policy,
                timeout,
            } => self.run_flows(files, *policy, timeout.map(Duration::from_secs)).await,
            Commands::Validate { files } => {
                self.validate_flows(files)?;
                Ok(true)
            }
        }
    }

    fn load_documents(files: &[PathBuf]) -> anyhow::Result<Vec<FlowDocument>> {
        files
            .iter()
            .map(|path| {
                parse_flow_file(path).with_context(|| format!("failed to load {}", path.display()))
            })
            .collect()
    }

    async fn run_flows(
        &self,
        files: &[PathBuf],
        policy: Option<PolicyKind>,
        timeout: Option<Duration>,
    ) -> anyhow::Result<bool> {
        let mut config = EngineConfig::load(self.config.as_deref())?;
        if let Some(policy) = policy {
            config.scheduling_policy = policy;
        }
        let documents = Self::load_documents(files)?;

        let backend = Arc::new(ShellBackend::new());
        ensure_healthy(backend.as_ref()).await?;
        let orchestrator = Orchestrator::new(config, backend)?;
        let metrics_server = match self.metrics_port {
            Some(port) => Some(orchestrator.metrics().serve(port).await?),
            None => None,
        };

        let mut ids: Vec<FlowId> = Vec::new();
        for document in documents {
            match document {
                FlowDocument::Single(definition) => ids.push(orchestrator.submit_flow(definition)?),
                FlowDocument::Bundle(bundle) => {
                    ids.extend(orchestrator.submit_bundle(bundle)?.into_values())
                }
            }
        }
        ids.sort_by_key(|id| orchestrator.get_flow(*id).map(|f| f.seq).unwrap_or(u64::MAX));
        info!("Submitted {} flow(s)", ids.len());

        orchestrator.start()?;
        let outcome = self.wait_all(&orchestrator, &ids, timeout).await;
        orchestrator.stop().await;
        if let Some(server) = metrics_server {
            server.abort();
        }

        let results = match outcome? {
            Some(results) => results,
            None => return Ok(false),
        };
        print_summary(&results);

        let success = results.iter().all(FlowResult::is_success);
        if success {
            info!("All flows completed successfully");
        } else {
            error!("One or more flows failed");
        }
        Ok(success)
    }

    /// `None` when interrupted or timed out
    async fn wait_all(
        &self,
        orchestrator: &Orchestrator,
        ids: &[FlowId],
        timeout: Option<Duration>,
    ) -> anyhow::Result<Option<Vec<FlowResult>>> {
        let all = futures::future::try_join_all(ids.iter().map(|id| orchestrator.wait_for(*id)));
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            results = all => Ok(Some(results?)),
            _ = deadline => {
                warn!("Timed out waiting for flows, cancelling");
                for id in ids {
                    orchestrator.cancel_flow(*id)?;
                }
                Ok(None)
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling flows");
                for id in ids {
                    orchestrator.cancel_flow(*id)?;
                }
                Ok(None)
            }
        }
    }

    /// Validate flow files without executing
    fn validate_flows(&self, files: &[PathBuf]) -> anyhow::Result<()> {
        for path in files {
            validate_file(path)?;
        }
        Ok(())
    }
}

/// Refuse to run flows on a backend that fails its health check
async fn ensure_healthy(backend: &dyn TaskBackend) -> anyhow::Result<()> {
    backend
        .health_check()
        .await
        .context("task backend failed its health check")?;
    info!("Task backend healthy");
    Ok(())
}

fn validate_file(path: &Path) -> anyhow::Result<()> {
    info!("Validating flow file: {:?}", path);
    let document =
        parse_flow_file(path).with_context(|| format!("failed to load {}", path.display()))?;

    match document {
        FlowDocument::Single(definition) => {
            let stages: Vec<&str> = definition.stages.iter().map(|s| s.name.as_str()).collect();
            println!("Flow '{}' is valid", definition.name);
            println!("Tasks: {}", definition.task_count());
            println!("Stages: {}", stages.join(" -> "));
        }
        FlowDocument::Bundle(bundle) => {
            let order: Vec<&str> = bundle
                .submission_order()?
                .into_iter()
                .map(|e| e.definition.name.as_str())
                .collect();
            println!("Bundle {} is valid", path.display());
            println!("Flows: {}", bundle.flows.len());
            println!("Submission order: {}", order.join(" -> "));
        }
    }
    Ok(())
}

fn print_summary(results: &[FlowResult]) {
    println!(
        "{:<36}  {:<24}  {:<10}  {:>7}  {:>10}",
        "FLOW ID", "NAME", "STATUS", "RETRIES", "DURATION"
    );
    println!("{}", "-".repeat(95));
    for result in results {
        let duration = result
            .duration
            .map(|d| format!("{:.2}s", d.as_secs_f64()))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<36}  {:<24}  {:<10}  {:>7}  {:>10}",
            result.flow_id, result.name, result.status, result.retry_count, duration
        );
        if let Some(failure) = &result.failure {
            println!("    cause: {}", failure.message);
        }
    }
}
