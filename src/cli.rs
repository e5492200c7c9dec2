use clap::{Parser, Subcommand};

use crate::config::Overrides;

#[derive(Parser, Debug)]
#[command(name = "loyalty")]
#[command(version)]
#[command(about = "Loyalty points accrual backend", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Service listen address; also serves health unless `server.health_address` is set
    #[arg(short = 'a', long, env = "RUN_ADDRESS", global = true)]
    pub run_address: Option<String>,

    /// PostgreSQL connection URI
    #[arg(short = 'd', long, env = "DATABASE_URI", global = true)]
    pub database_uri: Option<String>,

    /// Base URL of the accrual system
    #[arg(short = 'r', long, env = "ACCRUAL_SYSTEM_ADDRESS", global = true)]
    pub accrual_address: Option<String>,

    /// Directory holding default.toml and per-environment files
    #[arg(short, long, default_value = "config", global = true)]
    pub config_dir: String,

    /// Emit JSON formatted logs
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the accrual engine and health server (default)
    Run,
    /// Apply database migrations and exit
    Migrate,
    /// Validate configuration and exit
    CheckConfig,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }

    pub fn overrides(&self) -> Overrides {
        Overrides {
            run_address: self.run_address.clone(),
            database_uri: self.database_uri.clone(),
            accrual_address: self.accrual_address.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_flags() {
        let cli = Cli::try_parse_from([
            "loyalty",
            "-a",
            "0.0.0.0:9000",
            "-d",
            "postgres://localhost/loyalty",
            "-r",
            "http://localhost:8081",
        ])
        .unwrap();

        assert_eq!(cli.command(), Commands::Run);
        let overrides = cli.overrides();
        assert_eq!(overrides.run_address.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(
            overrides.accrual_address.as_deref(),
            Some("http://localhost:8081")
        );
    }

    #[test]
    fn test_subcommand() {
        let cli = Cli::try_parse_from(["loyalty", "migrate", "-d", "postgres://x"]).unwrap();
        assert_eq!(cli.command(), Commands::Migrate);
        assert_eq!(cli.overrides().database_uri.as_deref(), Some("postgres://x"));
    }

    #[test]
    fn test_flags_after_any_subcommand() {
        let cli = Cli::try_parse_from([
            "loyalty",
            "check-config",
            "-a",
            "127.0.0.1:9000",
            "-r",
            "http://accrual:8080",
            "--config-dir",
            "/etc/loyalty",
            "--json-logs",
        ])
        .unwrap();

        assert_eq!(cli.command(), Commands::CheckConfig);
        assert_eq!(cli.overrides().run_address.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(
            cli.overrides().accrual_address.as_deref(),
            Some("http://accrual:8080")
        );
        assert_eq!(cli.config_dir, "/etc/loyalty");
        assert!(cli.json_logs);
    }
}
