use clap::Parser;

/// Durable job queue server and worker.
#[derive(Debug, Parser)]
#[command(name = "conveyor", version, about)]
pub struct CliArgs {
    /// Path to the configuration file (overrides CONVEYOR_CONFIG_PATH).
    #[arg(short = 'c', long = "config-path")]
    pub config_path: Option<String>,

    /// Process role, `server` or `worker` (overrides the configured role).
    #[arg(long)]
    pub role: Option<String>,
}

impl CliArgs {
    /// The config path from the command line, else `CONVEYOR_CONFIG_PATH`.
    pub fn resolved_config_path(&self) -> Option<String> {
        self.config_path
            .clone()
            .or_else(|| std::env::var("CONVEYOR_CONFIG_PATH").ok())
            .filter(|path| !path.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_long_flags() {
        let args = CliArgs::parse_from(["conveyor", "-c", "conveyor.toml", "--role", "worker"]);
        assert_eq!(args.config_path.as_deref(), Some("conveyor.toml"));
        assert_eq!(args.role.as_deref(), Some("worker"));

        let args = CliArgs::parse_from(["conveyor", "--config-path=other.yaml"]);
        assert_eq!(args.resolved_config_path().as_deref(), Some("other.yaml"));
        assert!(args.role.is_none());
    }
}
