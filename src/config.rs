//! Configuration management for the loyalty-bonus gateway.
//!
//! Flags per spec.md §6, each overridden by the matching environment
//! variable if set. Grounded on this file's earlier `Config::from_env`/
//! `validate()` shape; CLI flags added via `clap`, adopted from the pack
//! (`Explore-Beyond-Innovations-ZeroXBridge_Sequencer/Cargo.toml`).

use clap::Parser;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "bonusbridge", about = "Loyalty-bonus accrual gateway")]
struct Cli {
    /// Bind address for the HTTP server
    #[arg(short = 'a', long, env = "RUN_ADDRESS", default_value = "localhost:8080")]
    run_address: String,

    /// Database connection string
    #[arg(short = 'd', long, env = "DATABASE_URI", default_value = "")]
    database_uri: String,

    /// Accrual system base URL
    #[arg(short = 'r', long, env = "ACCRUAL_SYSTEM_ADDRESS", default_value = "")]
    accrual_system_address: String,

    /// HMAC key used to sign JWTs
    #[arg(short = 'j', long, env = "JWT_KEY", default_value = "")]
    jwt_key: String,

    /// Log level (debug/info/warn/error)
    #[arg(short = 'l', long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub run_address: String,
    pub database_uri: String,
    pub accrual_system_address: String,
    pub jwt_key: String,
    pub log_level: String,

    /// Accrual poller tick interval (spec.md §4.D, default 5s).
    pub accrual_poll_interval: Duration,
    /// Fixed worker pool size (spec.md §4.C, production default 4).
    pub worker_count: usize,
    /// JWT lifetime (SPEC_FULL.md §6.1, fixed/non-sliding, default 24h).
    pub jwt_expiration: Duration,
}

impl Config {
    /// Parse CLI flags (each overridden by its environment variable via
    /// clap's `env` attribute) and apply the remaining, non-flag defaults.
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        let cli = Cli::parse_from(std::env::args());
        Self::from_cli(cli)
    }

    fn from_cli(cli: Cli) -> Self {
        let mut accrual_system_address = cli.accrual_system_address;
        if !accrual_system_address.is_empty()
            && !accrual_system_address.starts_with("http://")
            && !accrual_system_address.starts_with("https://")
        {
            accrual_system_address = format!("http://{}", accrual_system_address);
        }

        let config = Config {
            run_address: cli.run_address,
            database_uri: cli.database_uri,
            accrual_system_address,
            jwt_key: cli.jwt_key,
            log_level: cli.log_level,
            accrual_poll_interval: Duration::from_secs(5),
            worker_count: 4,
            jwt_expiration: Duration::from_secs(24 * 3600),
        };

        if config.jwt_key.is_empty() {
            tracing::warn!("JWT_KEY is empty; tokens will be signed with an empty key");
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_bare_accrual_host_with_http() {
        let cli = Cli {
            run_address: "localhost:8080".into(),
            database_uri: String::new(),
            accrual_system_address: "accrual.example.com".into(),
            jwt_key: "secret".into(),
            log_level: "info".into(),
        };
        let config = Config::from_cli(cli);
        assert_eq!(config.accrual_system_address, "http://accrual.example.com");
    }

    #[test]
    fn leaves_already_prefixed_accrual_host_alone() {
        let cli = Cli {
            run_address: "localhost:8080".into(),
            database_uri: String::new(),
            accrual_system_address: "https://accrual.example.com".into(),
            jwt_key: "secret".into(),
            log_level: "info".into(),
        };
        let config = Config::from_cli(cli);
        assert_eq!(config.accrual_system_address, "https://accrual.example.com");
    }
}
