use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use snark_coordinator::api::{self, ApiState};
use snark_coordinator::config::{CoordinatorConfig, ServerConfig};
use snark_coordinator::coordinator::Coordinator;
use snark_coordinator::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "snark-coordinator")]
#[command(version)]
#[command(about = "Coordinator for distributed SNARK proof generation")]
struct Args {
    /// Address the HTTP API listens on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Evict workers silent for longer than this many milliseconds
    #[arg(long, default_value_t = 10_000)]
    heartbeat_timeout_ms: u64,

    /// Default per-assignment deadline in milliseconds
    #[arg(long, default_value_t = 60_000)]
    assignment_timeout_ms: u64,

    /// Upper bound for job-specific assignment deadlines
    #[arg(long, default_value_t = 300_000)]
    max_assignment_timeout_ms: u64,

    /// Retries granted to a job after its first failed attempt
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Reject submissions once this many jobs are pending
    #[arg(long, default_value_t = 10_000)]
    max_pending_jobs: usize,

    /// Capacity assumed for workers that do not declare one
    #[arg(long, default_value_t = 1)]
    default_worker_capacity: usize,

    /// Largest accepted payload in bytes
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    max_payload_bytes: usize,

    /// Longest accepted job or worker id
    #[arg(long, default_value_t = 100)]
    max_id_len: usize,

    /// Keep finished jobs queryable for this many milliseconds
    #[arg(long, default_value_t = 3_600_000)]
    result_retention_ms: u64,

    /// Events kept per worker in the stats log
    #[arg(long, default_value_t = 256)]
    worker_history_len: usize,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let coordinator = CoordinatorConfig {
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            assignment_timeout_ms: self.assignment_timeout_ms,
            max_assignment_timeout_ms: self.max_assignment_timeout_ms,
            max_retries: self.max_retries,
            max_pending_jobs: self.max_pending_jobs,
            default_worker_capacity: self.default_worker_capacity,
            max_payload_bytes: self.max_payload_bytes,
            max_id_len: self.max_id_len,
            result_retention_ms: self.result_retention_ms,
            worker_history_len: self.worker_history_len,
            ..CoordinatorConfig::default()
        };
        ServerConfig::new(self.listen, coordinator)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config();
    let coordinator = Arc::new(Coordinator::new(config.coordinator.clone())?);

    tracing::info!(
        listen = %config.listen_addr,
        heartbeat_timeout_ms = config.coordinator.heartbeat_timeout_ms,
        max_retries = config.coordinator.max_retries,
        max_pending_jobs = config.coordinator.max_pending_jobs,
        "Starting coordinator"
    );

    let shutdown = install_shutdown_handler();

    let maintenance = {
        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { coordinator.run(shutdown).await })
    };

    let state = ApiState::new(coordinator);
    let served = api::serve(config.listen_addr, state, shutdown.clone()).await;

    // Stop the maintenance loop even if the server failed to start.
    shutdown.cancel();
    if let Err(e) = maintenance.await {
        tracing::error!(error = %e, "Maintenance task panicked");
    }

    served?;
    tracing::info!("Coordinator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_coordinator_config() {
        let config = Args::try_parse_from(["snark-coordinator"]).unwrap().into_config();
        assert_eq!(config.listen_addr, ServerConfig::default().listen_addr);
        assert_eq!(config.coordinator, CoordinatorConfig::default());
    }

    #[test]
    fn max_id_len_flag() {
        let config = Args::try_parse_from(["snark-coordinator", "--max-id-len", "16"])
            .unwrap()
            .into_config();
        assert_eq!(config.coordinator.max_id_len, 16);
        assert!(config.coordinator.validate().is_ok());
    }
}
