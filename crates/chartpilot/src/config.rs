//! Command line and operator configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::Error;

#[derive(Parser, Debug, Clone)]
#[command(name = "chartpilot")]
#[command(version)]
#[command(about = "Kubernetes operator that installs a chart release for every custom resource", long_about = None)]
pub struct Cli {
    /// Watches file mapping custom resource kinds to charts
    #[arg(long, env = "WATCHES_FILE", default_value = "./watches.yaml")]
    pub watches_file: PathBuf,

    /// Default interval between periodic reconciles (0 disables them)
    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    pub reconcile_period: Duration,

    /// Default number of concurrent reconciles per watched kind [default: CPU count]
    #[arg(long)]
    pub max_concurrent_reconciles: Option<usize>,

    /// Only watch this namespace (empty watches the whole cluster)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Time allowed for in-flight reconciles to finish on shutdown
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub shutdown_grace_period: Duration,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

/// Validated operator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    pub watches_file: PathBuf,
    pub reconcile_period: Duration,
    pub max_concurrent_reconciles: usize,
    /// `None` watches every namespace
    pub namespace: Option<String>,
    pub shutdown_grace_period: Duration,
    pub log_format: LogFormat,
}

impl TryFrom<Cli> for OperatorConfig {
    type Error = Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let max_concurrent_reconciles = match cli.max_concurrent_reconciles {
            Some(0) => {
                return Err(Error::Config(
                    "--max-concurrent-reconciles must be at least 1".to_string(),
                ));
            }
            Some(n) => n,
            None => std::thread::available_parallelism().map_or(1, |n| n.get()),
        };

        if cli.watches_file.as_os_str().is_empty() {
            return Err(Error::Config("--watches-file must not be empty".to_string()));
        }

        let namespace = cli
            .namespace
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty());

        Ok(Self {
            watches_file: cli.watches_file,
            reconcile_period: cli.reconcile_period,
            max_concurrent_reconciles,
            namespace,
            shutdown_grace_period: cli.shutdown_grace_period,
            log_format: cli.log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("chartpilot").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::try_from(parse(&[])).unwrap();
        assert_eq!(config.reconcile_period, Duration::from_secs(60));
        assert_eq!(config.shutdown_grace_period, Duration::from_secs(30));
        assert!(config.max_concurrent_reconciles >= 1);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_explicit_flags() {
        let config = OperatorConfig::try_from(parse(&[
            "--watches-file",
            "/etc/chartpilot/watches.yaml",
            "--reconcile-period",
            "90s",
            "--max-concurrent-reconciles",
            "8",
            "--namespace",
            "apps",
            "--log-format",
            "json",
        ]))
        .unwrap();
        assert_eq!(config.watches_file, PathBuf::from("/etc/chartpilot/watches.yaml"));
        assert_eq!(config.reconcile_period, Duration::from_secs(90));
        assert_eq!(config.max_concurrent_reconciles, 8);
        assert_eq!(config.namespace.as_deref(), Some("apps"));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_zero_period_disables_periodic_reconciles() {
        let config = OperatorConfig::try_from(parse(&["--reconcile-period", "0s"])).unwrap();
        assert!(config.reconcile_period.is_zero());
    }

    #[test]
    fn test_empty_namespace_is_cluster_wide() {
        let config = OperatorConfig::try_from(parse(&["--namespace", ""])).unwrap();
        assert!(config.namespace.is_none());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let err = OperatorConfig::try_from(parse(&["--max-concurrent-reconciles", "0"])).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn test_invalid_duration() {
        assert!(
            Cli::try_parse_from(["chartpilot", "--reconcile-period", "soon"]).is_err()
        );
    }
}
