use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][-a-zA-Z0-9\.]*[a-zA-Z0-9]$").expect("hostname pattern is valid")
});

static QUEUE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,64}$").expect("queue name pattern is valid"));

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub logging: Option<LoggingSection>,
    #[serde(default)]
    pub database: Option<DatabaseSection>,
    #[serde(default)]
    pub process: Option<ProcessSection>,
    #[serde(default)]
    pub job_queue: Option<JobQueueSection>,
    #[serde(default)]
    pub bridge: Option<BridgeSection>,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: Option<bool>,
    #[serde(default)]
    pub log_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessSection {
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JobQueueSection {
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(default)]
    pub stale_timeout_secs: Option<u64>,
    #[serde(default)]
    pub graceful_shutdown_secs: Option<u64>,
    #[serde(default)]
    pub default_retries: Option<u32>,
    #[serde(default)]
    pub default_concurrency: Option<usize>,
    #[serde(default)]
    pub buffering: Option<bool>,
    #[serde(default)]
    pub claim_batch: Option<u32>,
    #[serde(default)]
    pub buffer_flush_ms: Option<u64>,
    #[serde(default)]
    pub backoff: Option<BackoffSection>,
    #[serde(default)]
    pub queues: Option<BTreeMap<String, QueueSection>>,
}

#[derive(Debug, Deserialize)]
pub struct BackoffSection {
    #[serde(default)]
    pub initial_ms: Option<u64>,
    #[serde(default)]
    pub factor: Option<f64>,
    #[serde(default)]
    pub max_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Option<bool>,
}

/// Per-queue overrides. Unset fields fall back to the `job_queue` defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueueSection {
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub run_on: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BridgeSection {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Load a RawConfigFile from a path. The format is inferred from the extension: .toml, .yaml/.yml, .json
pub fn load_raw_from_file<P: AsRef<Path>>(path: P) -> Result<RawConfigFile, ConfigError> {
    let path = path.as_ref();
    let s = fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());
    parse_config_str(&s, ext.as_deref())
}

#[inline]
fn parse_config_str(s: &str, ext: Option<&str>) -> Result<RawConfigFile, ConfigError> {
    match ext {
        #[cfg(feature = "toml")]
        Some("toml") => toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        #[cfg(feature = "yaml")]
        Some("yaml" | "yml") => {
            serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        #[cfg(feature = "json")]
        Some("json") => serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string())),
        _ => parse_config_auto(s),
    }
}

/// Try every enabled format in turn.
#[inline]
fn parse_config_auto(s: &str) -> Result<RawConfigFile, ConfigError> {
    #[cfg(feature = "toml")]
    if let Ok(cfg) = toml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "json")]
    if let Ok(cfg) = serde_json::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(feature = "yaml")]
    if let Ok(cfg) = serde_yaml::from_str(s) {
        return Ok(cfg);
    }

    #[cfg(any(feature = "yaml", feature = "toml", feature = "json"))]
    {
        Err(ConfigError::Parse(
            "failed to parse config as any supported format".into(),
        ))
    }

    #[cfg(not(any(feature = "yaml", feature = "toml", feature = "json")))]
    {
        let _ = s;
        Err(ConfigError::Parse("no config format enabled".into()))
    }
}

/// Concrete configuration with defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub process: ProcessConfig,
    pub job_queue: JobQueueConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessConfig {
    /// `server` or `worker`.
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobQueueConfig {
    /// `sqlite` or `memory`.
    pub strategy: String,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub stale_timeout_secs: u64,
    pub graceful_shutdown_secs: u64,
    pub default_retries: u32,
    pub default_concurrency: usize,
    pub buffering: bool,
    pub claim_batch: u32,
    /// How often named buffers are flushed once the service runs.
    pub buffer_flush_ms: u64,
    pub backoff: BackoffConfig,
    pub queues: BTreeMap<String, QueueSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub factor: f64,
    pub max_ms: u64,
    pub jitter: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeConfig {
    /// `tcp://host:port` the worker listens on and the server connects to.
    /// Unset means both roles share one process and talk in memory.
    pub address: Option<String>,
    pub timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 6000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
                log_dir: None,
            },
            database: DatabaseConfig {
                url: "sqlite://conveyor.sqlite".to_string(),
                max_connections: 10,
                min_connections: 1,
                busy_timeout_ms: 5_000,
            },
            process: ProcessConfig {
                role: "server".to_string(),
            },
            job_queue: JobQueueConfig {
                strategy: "sqlite".to_string(),
                poll_interval_ms: 1_000,
                heartbeat_interval_ms: 5_000,
                stale_timeout_secs: 60,
                graceful_shutdown_secs: 20,
                default_retries: 0,
                default_concurrency: 1,
                buffering: true,
                claim_batch: 10,
                buffer_flush_ms: 2_000,
                backoff: BackoffConfig {
                    initial_ms: 1_000,
                    factor: 2.0,
                    max_ms: 600_000,
                    jitter: true,
                },
                queues: BTreeMap::new(),
            },
            bridge: BridgeConfig {
                address: None,
                timeout_ms: 5_000,
            },
        }
    }
}

impl JobQueueConfig {
    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[inline]
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    #[inline]
    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }

    #[inline]
    pub fn buffer_flush_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_flush_ms)
    }

    /// Overrides for `queue`, if any were configured.
    pub fn queue(&self, queue: &str) -> Option<&QueueSection> {
        self.queues.get(queue)
    }
}

impl BridgeConfig {
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The `host:port` part of the configured address.
    pub fn socket_address(&self) -> Result<Option<String>, ConfigError> {
        self.address.as_deref().map(parse_bridge_address).transpose()
    }
}

fn parse_bridge_address(address: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::Validation(format!("invalid bridge.address: {address}"));
    let parsed = url::Url::parse(address).map_err(|_| invalid())?;
    if parsed.scheme() != "tcp" {
        return Err(ConfigError::Validation(format!(
            "bridge.address must use the tcp scheme: {address}"
        )));
    }
    let host = parsed.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
    let port = parsed.port().ok_or_else(invalid)?;
    Ok(format!("{host}:{port}"))
}

#[inline]
fn parse_bool(s: &str) -> Result<bool, ()> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(()),
    }
}

macro_rules! apply_opt {
    ($target:expr, $source:expr) => {
        if let Some(v) = $source {
            $target = v;
        }
    };
    ($target:expr, $source:expr, wrap) => {
        if let Some(v) = $source {
            $target = Some(v);
        }
    };
}

/// Load concrete `Config` from an optional file and the environment.
/// Environment variables take precedence over file values and defaults.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();

    if let Some(p) = path {
        let raw = load_raw_from_file(p)?;
        apply_raw(&mut cfg, raw);
    }

    apply_env_overrides(&mut cfg)?;

    Ok(cfg)
}

/// Merge file values onto `cfg`.
pub fn apply_raw(cfg: &mut Config, raw: RawConfigFile) {
    if let Some(server) = raw.server {
        apply_opt!(cfg.server.host, server.host);
        apply_opt!(cfg.server.port, server.port);
    }
    if let Some(logging) = raw.logging {
        apply_opt!(cfg.logging.level, logging.level);
        apply_opt!(cfg.logging.json, logging.json);
        apply_opt!(cfg.logging.log_dir, logging.log_dir, wrap);
    }
    if let Some(db) = raw.database {
        apply_opt!(cfg.database.url, db.url);
        apply_opt!(cfg.database.max_connections, db.max_connections);
        apply_opt!(cfg.database.min_connections, db.min_connections);
        apply_opt!(cfg.database.busy_timeout_ms, db.busy_timeout_ms);
    }
    if let Some(process) = raw.process {
        apply_opt!(cfg.process.role, process.role);
    }
    if let Some(jq) = raw.job_queue {
        let target = &mut cfg.job_queue;
        apply_opt!(target.strategy, jq.strategy);
        apply_opt!(target.poll_interval_ms, jq.poll_interval_ms);
        apply_opt!(target.heartbeat_interval_ms, jq.heartbeat_interval_ms);
        apply_opt!(target.stale_timeout_secs, jq.stale_timeout_secs);
        apply_opt!(target.graceful_shutdown_secs, jq.graceful_shutdown_secs);
        apply_opt!(target.default_retries, jq.default_retries);
        apply_opt!(target.default_concurrency, jq.default_concurrency);
        apply_opt!(target.buffering, jq.buffering);
        apply_opt!(target.claim_batch, jq.claim_batch);
        apply_opt!(target.buffer_flush_ms, jq.buffer_flush_ms);
        if let Some(backoff) = jq.backoff {
            apply_opt!(target.backoff.initial_ms, backoff.initial_ms);
            apply_opt!(target.backoff.factor, backoff.factor);
            apply_opt!(target.backoff.max_ms, backoff.max_ms);
            apply_opt!(target.backoff.jitter, backoff.jitter);
        }
        if let Some(queues) = jq.queues {
            target.queues.extend(queues);
        }
    }
    if let Some(bridge) = raw.bridge {
        apply_opt!(cfg.bridge.address, bridge.address, wrap);
        apply_opt!(cfg.bridge.timeout_ms, bridge.timeout_ms);
    }
}

#[inline]
fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Parse(format!("invalid {key}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[inline]
fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(v) => parse_bool(&v)
            .map(Some)
            .map_err(|_| ConfigError::Parse(format!("invalid {key}"))),
        Err(_) => Ok(None),
    }
}

#[inline]
fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn apply_env_overrides(cfg: &mut Config) -> Result<(), ConfigError> {
    // Server
    apply_opt!(cfg.server.host, env_str("CONVEYOR_SERVER_HOST"));
    apply_opt!(cfg.server.port, env_parse("CONVEYOR_SERVER_PORT")?);

    // Logging
    apply_opt!(cfg.logging.level, env_str("CONVEYOR_LOG_LEVEL"));
    apply_opt!(cfg.logging.json, env_bool("CONVEYOR_LOG_JSON")?);
    apply_opt!(cfg.logging.log_dir, env_str("CONVEYOR_LOG_DIR"), wrap);

    // Database
    apply_opt!(cfg.database.url, env_str("CONVEYOR_DATABASE_URL"));
    apply_opt!(
        cfg.database.max_connections,
        env_parse("CONVEYOR_DB_MAX_CONNECTIONS")?
    );
    apply_opt!(
        cfg.database.min_connections,
        env_parse("CONVEYOR_DB_MIN_CONNECTIONS")?
    );
    apply_opt!(
        cfg.database.busy_timeout_ms,
        env_parse("CONVEYOR_DB_BUSY_TIMEOUT_MS")?
    );

    // Process
    apply_opt!(cfg.process.role, env_str("CONVEYOR_ROLE"));

    // Job queue
    let jq = &mut cfg.job_queue;
    apply_opt!(jq.strategy, env_str("CONVEYOR_JOB_QUEUE_STRATEGY"));
    apply_opt!(jq.poll_interval_ms, env_parse("CONVEYOR_POLL_INTERVAL_MS")?);
    apply_opt!(
        jq.heartbeat_interval_ms,
        env_parse("CONVEYOR_HEARTBEAT_INTERVAL_MS")?
    );
    apply_opt!(jq.stale_timeout_secs, env_parse("CONVEYOR_STALE_TIMEOUT_SECS")?);
    apply_opt!(
        jq.graceful_shutdown_secs,
        env_parse("CONVEYOR_GRACEFUL_SHUTDOWN_SECS")?
    );
    apply_opt!(jq.default_retries, env_parse("CONVEYOR_DEFAULT_RETRIES")?);
    apply_opt!(
        jq.default_concurrency,
        env_parse("CONVEYOR_DEFAULT_CONCURRENCY")?
    );
    apply_opt!(jq.buffering, env_bool("CONVEYOR_BUFFERING")?);
    apply_opt!(jq.claim_batch, env_parse("CONVEYOR_CLAIM_BATCH")?);
    apply_opt!(jq.buffer_flush_ms, env_parse("CONVEYOR_BUFFER_FLUSH_MS")?);

    // Bridge
    apply_opt!(cfg.bridge.address, env_str("CONVEYOR_BRIDGE_ADDRESS"), wrap);
    apply_opt!(cfg.bridge.timeout_ms, env_parse("CONVEYOR_BRIDGE_TIMEOUT_MS")?);

    Ok(())
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

/// Validate higher-level constraints on the resolved configuration.
pub fn validate_config(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server.port == 0 {
        return Err(invalid("server.port must be > 0"));
    }
    let host_ok = cfg.server.host.parse::<std::net::IpAddr>().is_ok()
        || HOSTNAME_REGEX.is_match(&cfg.server.host);
    if !host_ok {
        return Err(invalid(format!("invalid server.host: {}", cfg.server.host)));
    }

    if !LOG_LEVELS.contains(&cfg.logging.level.to_ascii_lowercase().as_str()) {
        return Err(invalid(format!("invalid logging.level: {}", cfg.logging.level)));
    }

    if !cfg.database.url.starts_with("sqlite:") {
        return Err(invalid(format!(
            "database.url must be a sqlite URL: {}",
            cfg.database.url
        )));
    }
    if cfg.database.max_connections == 0
        || cfg.database.min_connections > cfg.database.max_connections
    {
        return Err(invalid(
            "database.max_connections must be > 0 and >= database.min_connections",
        ));
    }

    match cfg.process.role.to_ascii_lowercase().as_str() {
        "server" | "worker" => {}
        other => return Err(invalid(format!("unknown process.role: {other}"))),
    }

    let jq = &cfg.job_queue;
    match jq.strategy.as_str() {
        "sqlite" | "memory" => {}
        other => return Err(invalid(format!("unknown job_queue.strategy: {other}"))),
    }
    if jq.poll_interval_ms == 0 || jq.heartbeat_interval_ms == 0 || jq.buffer_flush_ms == 0 {
        return Err(invalid(
            "job_queue poll, heartbeat and buffer flush intervals must be > 0",
        ));
    }
    if jq.stale_timeout_secs.saturating_mul(1000) <= jq.heartbeat_interval_ms {
        return Err(invalid(
            "job_queue.stale_timeout_secs must exceed the heartbeat interval",
        ));
    }
    if jq.default_concurrency == 0 {
        return Err(invalid("job_queue.default_concurrency must be > 0"));
    }
    if !(jq.backoff.factor.is_finite() && jq.backoff.factor >= 1.0) {
        return Err(invalid("job_queue.backoff.factor must be >= 1"));
    }
    if jq.backoff.max_ms < jq.backoff.initial_ms {
        return Err(invalid("job_queue.backoff.max_ms must be >= initial_ms"));
    }
    for (name, queue) in &jq.queues {
        if !QUEUE_NAME_REGEX.is_match(name) {
            return Err(invalid(format!("invalid queue name: {name}")));
        }
        if queue.concurrency == Some(0) {
            return Err(invalid(format!("job_queue.queues.{name}.concurrency must be > 0")));
        }
        if let Some(run_on) = &queue.run_on {
            match run_on.to_ascii_lowercase().as_str() {
                "worker" | "server" | "any" => {}
                other => {
                    return Err(invalid(format!(
                        "job_queue.queues.{name}.run_on must be worker, server or any: {other}"
                    )))
                }
            }
        }
    }

    cfg.bridge.socket_address()?;
    if cfg.bridge.timeout_ms == 0 {
        return Err(invalid("bridge.timeout_ms must be > 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Env-var tests share process state.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
        let f = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("tmpfile");
        std::fs::write(f.path(), contents).unwrap();
        f
    }

    #[test]
    fn parse_toml() {
        let f = write_config(
            ".toml",
            r#"
[server]
host = "127.0.0.1"
port = 7000

[job_queue]
strategy = "memory"
poll_interval_ms = 250

[job_queue.backoff]
initial_ms = 500

[job_queue.queues.emails]
concurrency = 1
retries = 3

[job_queue.queues.indexing]
concurrency = 5
run_on = "any"
"#,
        );
        let raw = load_raw_from_file(f.path()).expect("load");
        let mut cfg = Config::default();
        apply_raw(&mut cfg, raw);

        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 7000);
        assert_eq!(cfg.job_queue.strategy, "memory");
        assert_eq!(cfg.job_queue.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.job_queue.backoff.initial_ms, 500);
        assert_eq!(cfg.job_queue.backoff.max_ms, 600_000);
        assert_eq!(cfg.job_queue.queue("emails").unwrap().retries, Some(3));
        assert_eq!(
            cfg.job_queue.queue("indexing").unwrap().run_on.as_deref(),
            Some("any")
        );
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn parse_yaml() {
        let f = write_config(
            ".yaml",
            r#"
process:
  role: worker
bridge:
  address: tcp://127.0.0.1:7100
  timeout_ms: 2000
database:
  url: sqlite://data/jobs.db
"#,
        );
        let raw = load_raw_from_file(f.path()).expect("load");
        assert_eq!(raw.process.unwrap().role.as_deref(), Some("worker"));
        let bridge = raw.bridge.unwrap();
        assert_eq!(bridge.address.as_deref(), Some("tcp://127.0.0.1:7100"));
        assert_eq!(bridge.timeout_ms, Some(2000));
        assert_eq!(raw.database.unwrap().url.as_deref(), Some("sqlite://data/jobs.db"));
    }

    #[test]
    fn parse_without_extension_tries_every_format() {
        let f = write_config("", r#"{"logging": {"level": "debug", "json": true}}"#);
        let raw = load_raw_from_file(f.path()).expect("load");
        let logging = raw.logging.unwrap();
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.json, Some(true));

        let garbage = write_config(".toml", "server = [");
        assert!(matches!(
            load_raw_from_file(garbage.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        let keys = [
            "CONVEYOR_SERVER_PORT",
            "CONVEYOR_LOG_JSON",
            "CONVEYOR_ROLE",
            "CONVEYOR_POLL_INTERVAL_MS",
            "CONVEYOR_BUFFERING",
            "CONVEYOR_BRIDGE_ADDRESS",
        ];
        for k in keys {
            env::remove_var(k);
        }

        let f = write_config(".toml", "[server]\nport = 7000\n[process]\nrole = \"server\"\n");
        env::set_var("CONVEYOR_SERVER_PORT", "7001");
        env::set_var("CONVEYOR_LOG_JSON", "yes");
        env::set_var("CONVEYOR_ROLE", "worker");
        env::set_var("CONVEYOR_POLL_INTERVAL_MS", "50");
        env::set_var("CONVEYOR_BUFFERING", "off");
        env::set_var("CONVEYOR_BRIDGE_ADDRESS", "tcp://localhost:7100");

        let cfg = load_config(Some(f.path())).expect("load config");
        assert_eq!(cfg.server.port, 7001);
        assert!(cfg.logging.json);
        assert_eq!(cfg.process.role, "worker");
        assert_eq!(cfg.job_queue.poll_interval_ms, 50);
        assert!(!cfg.job_queue.buffering);
        assert_eq!(
            cfg.bridge.socket_address().unwrap().as_deref(),
            Some("localhost:7100")
        );

        env::set_var("CONVEYOR_SERVER_PORT", "not-a-port");
        assert!(matches!(
            load_config::<&Path>(None),
            Err(ConfigError::Parse(_))
        ));

        for k in keys {
            env::remove_var(k);
        }
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(validate_config(&Config::default()).is_ok());

        let mut cfg = Config::default();
        cfg.process.role = "scheduler".into();
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.job_queue.strategy = "redis".into();
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.job_queue.stale_timeout_secs = 1;
        cfg.job_queue.heartbeat_interval_ms = 5_000;
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.job_queue
            .queues
            .insert("bad name".into(), QueueSection::default());
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.job_queue.queues.insert(
            "emails".into(),
            QueueSection {
                run_on: Some("everywhere".into()),
                ..QueueSection::default()
            },
        );
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.bridge.address = Some("http://localhost:7100".into());
        assert!(validate_config(&cfg).is_err());
        cfg.bridge.address = Some("tcp://localhost".into());
        assert!(validate_config(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.database.url = "postgres://localhost/jobs".into();
        assert!(validate_config(&cfg).is_err());
    }
}
