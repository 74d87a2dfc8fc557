use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use conveyor_config::{Config, ConfigError};
use conveyor_db_connection::{DbConnectionConfig, DbConnectionError};
use conveyor_job_queue::bridge::{ProcessBridge, TcpTransport};
use conveyor_job_queue::{
    BackoffPolicy, DispatchConfig, InMemoryJobQueueStrategy, JobQueueError, JobQueueStrategy,
    ProcessRole, QueueOptions, RunOn,
};
use conveyor_job_store::{SqlJobQueueStrategy, StoreError};
use std::time::Duration;

/// Prefix of the environment variables read by [`DbConnectionConfig::from_env`].
pub const ENV_PREFIX: &str = "CONVEYOR";

/// Build the pool config. `CONVEYOR_DATABASE_URL` and friends win over the file.
pub fn database_config_from_config(cfg: &Config) -> DbConnectionConfig {
    let from_file = || DbConnectionConfig {
        max_connections: cfg.database.max_connections,
        min_connections: cfg.database.min_connections,
        busy_timeout_ms: cfg.database.busy_timeout_ms,
        ..DbConnectionConfig::new(cfg.database.url.clone())
    };
    match DbConnectionConfig::from_env(ENV_PREFIX) {
        Ok(config) => config,
        Err(DbConnectionError::MissingEnvVar(_)) => from_file(),
        Err(error) => {
            tracing::warn!(%error, "ignoring database environment; using configured values");
            from_file()
        }
    }
}

pub fn process_role(cfg: &Config) -> Result<ProcessRole, JobQueueError> {
    cfg.process.role.parse()
}

/// Engine settings for this process.
pub fn job_queue_config(cfg: &Config, role: ProcessRole) -> conveyor_job_queue::JobQueueConfig {
    let jq = &cfg.job_queue;
    conveyor_job_queue::JobQueueConfig {
        role,
        dispatch: DispatchConfig {
            poll_interval: jq.poll_interval(),
            heartbeat_interval: jq.heartbeat_interval(),
            stale_timeout: jq.stale_timeout(),
            backoff: BackoffPolicy {
                initial: Duration::from_millis(jq.backoff.initial_ms),
                factor: jq.backoff.factor,
                max: Duration::from_millis(jq.backoff.max_ms),
                jitter: jq.backoff.jitter,
            },
            graceful_shutdown_timeout: jq.graceful_shutdown(),
        },
        buffering: jq.buffering,
        ..conveyor_job_queue::JobQueueConfig::default()
    }
}

/// Registration options of `queue`: the `job_queue` defaults with the
/// queue's own overrides on top. Without a bridge address there is no
/// separate worker, so queues run wherever they are registered.
pub fn queue_options(cfg: &Config, queue: &str) -> QueueOptions {
    let jq = &cfg.job_queue;
    let section = jq.queue(queue);
    let fallback_run_on = if cfg.bridge.address.is_some() {
        RunOn::Worker
    } else {
        RunOn::Any
    };

    QueueOptions::default()
        .with_concurrency(
            section
                .and_then(|s| s.concurrency)
                .unwrap_or(jq.default_concurrency),
        )
        .with_retries(section.and_then(|s| s.retries).unwrap_or(jq.default_retries))
        .with_run_on(
            section
                .and_then(|s| s.run_on.as_deref())
                .and_then(|run_on| run_on.parse().ok())
                .unwrap_or(fallback_run_on),
        )
}

/// Open the configured strategy.
pub async fn strategy_from_config(
    cfg: &Config,
) -> Result<Arc<dyn JobQueueStrategy>, StoreError> {
    match cfg.job_queue.strategy.as_str() {
        "memory" => {
            tracing::warn!("using the in-memory job strategy; jobs are lost on restart");
            Ok(Arc::new(InMemoryJobQueueStrategy::new()))
        }
        _ => {
            let db_cfg = database_config_from_config(cfg);
            let strategy = SqlJobQueueStrategy::connect(&db_cfg)
                .await?
                .with_claim_batch(cfg.job_queue.claim_batch);
            Ok(Arc::new(strategy))
        }
    }
}

/// The sending side of the bridge: TCP to the worker when an address is
/// configured, otherwise the handlers run in this process.
pub fn bridge_from_config(cfg: &Config, role: ProcessRole) -> Result<ProcessBridge, ConfigError> {
    Ok(match cfg.bridge.socket_address()? {
        Some(address) => ProcessBridge::new(
            role,
            Arc::new(TcpTransport::new(address, cfg.bridge.timeout())),
        ),
        None => ProcessBridge::local(role, conveyor_jobs::bridge_router()),
    })
}

/// Parse host:port into a SocketAddr, with fallback to 0.0.0.0.
pub fn parse_bind_address(host: &str, port: u16) -> SocketAddr {
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .or_else(|_| host.parse::<SocketAddr>())
        .or_else(|_| host.parse::<Ipv6Addr>().map(|ip| SocketAddr::new(IpAddr::V6(ip), port)))
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_config::QueueSection;

    #[test]
    fn queue_options_layer_defaults_and_overrides() {
        let mut cfg = Config::default();
        cfg.job_queue.default_retries = 2;
        cfg.job_queue.queues.insert(
            "send-email".into(),
            QueueSection {
                concurrency: Some(1),
                retries: Some(5),
                run_on: Some("server".into()),
            },
        );

        let emails = queue_options(&cfg, "send-email");
        assert_eq!(emails.concurrency, 1);
        assert_eq!(emails.retries, 5);
        assert_eq!(emails.run_on, RunOn::Server);

        let other = queue_options(&cfg, "update-search-index");
        assert_eq!(other.concurrency, cfg.job_queue.default_concurrency);
        assert_eq!(other.retries, 2);
        assert_eq!(other.run_on, RunOn::Any);

        cfg.bridge.address = Some("tcp://127.0.0.1:7100".into());
        assert_eq!(queue_options(&cfg, "update-search-index").run_on, RunOn::Worker);
    }

    #[test]
    fn engine_settings_follow_the_config() {
        let mut cfg = Config::default();
        cfg.job_queue.poll_interval_ms = 250;
        cfg.job_queue.buffering = false;
        cfg.job_queue.backoff.jitter = false;

        let engine = job_queue_config(&cfg, ProcessRole::Worker);
        assert_eq!(engine.role, ProcessRole::Worker);
        assert_eq!(engine.dispatch.poll_interval, Duration::from_millis(250));
        assert_eq!(engine.dispatch.stale_timeout, Duration::from_secs(60));
        assert!(!engine.dispatch.backoff.jitter);
        assert!(!engine.buffering);

        assert_eq!(process_role(&cfg).unwrap(), ProcessRole::Server);
    }

    #[test]
    fn bind_address_parsing() {
        assert_eq!(
            parse_bind_address("127.0.0.1", 6000),
            SocketAddr::from(([127, 0, 0, 1], 6000))
        );
        assert_eq!(
            parse_bind_address("not an address", 6000),
            SocketAddr::from(([0, 0, 0, 0], 6000))
        );
    }

    #[tokio::test]
    async fn memory_strategy_needs_no_database() {
        let mut cfg = Config::default();
        cfg.job_queue.strategy = "memory".into();
        let strategy = strategy_from_config(&cfg).await.unwrap();
        assert_eq!(strategy.name(), "memory");
    }

    #[test]
    fn bridge_rejects_non_tcp_addresses() {
        let mut cfg = Config::default();
        assert!(bridge_from_config(&cfg, ProcessRole::Server).is_ok());
        cfg.bridge.address = Some("udp://127.0.0.1:1".into());
        assert!(bridge_from_config(&cfg, ProcessRole::Server).is_err());
    }
}
