//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - scan: discover throttled issues and queue them
//! - process: run one scheduling pass
//! - run: scan then process, for cron
//! - enqueue: queue an item by hand
//! - status: queue, slot and breaker overview
//! - prune: drop old attempt and error history

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Retrigger - retries rate-limited bot analyses within an inferred capacity budget
#[derive(Parser, Debug)]
#[command(name = "retrigger")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan owned repositories for rate-limited issues and queue them
    Scan,

    /// Run one scheduling pass over the queue
    Process,

    /// Scan, then run one scheduling pass
    Run,

    /// Queue an item manually
    Enqueue {
        /// Namespace of the item, e.g. owner/repo
        namespace: String,

        /// Item identifier, e.g. an issue number
        identifier: u64,

        /// Throttle duration the downstream system reported
        #[arg(short, long, default_value_t = 0)]
        throttle_secs: u64,
    },

    /// Show queue, capacity and circuit breaker state
    Status,

    /// Delete attempt and error history older than the given age
    Prune {
        /// Age in days; history still needed for scheduling is always kept
        #[arg(short, long, default_value_t = 30)]
        days: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["retrigger"]).is_err());
    }

    #[test]
    fn test_cli_verbose_flag() {
        let cli = Cli::try_parse_from(["retrigger", "-v", "status"]).unwrap();
        assert!(cli.is_verbose());
    }

    #[test]
    fn test_cli_config_option() {
        let cli = Cli::try_parse_from(["retrigger", "process", "-c", "/path/to/retrigger.yml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/retrigger.yml")));
        assert!(matches!(cli.command, Commands::Process));
    }

    #[test]
    fn test_scan_and_run() {
        let cli = Cli::try_parse_from(["retrigger", "scan"]).unwrap();
        assert!(matches!(cli.command, Commands::Scan));

        let cli = Cli::try_parse_from(["retrigger", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run));
    }

    #[test]
    fn test_enqueue_command() {
        let cli = Cli::try_parse_from(["retrigger", "enqueue", "acme/widgets", "42", "--throttle-secs", "600"]).unwrap();
        match cli.command {
            Commands::Enqueue {
                namespace,
                identifier,
                throttle_secs,
            } => {
                assert_eq!(namespace, "acme/widgets");
                assert_eq!(identifier, 42);
                assert_eq!(throttle_secs, 600);
            }
            _ => panic!("Expected enqueue command"),
        }
    }

    #[test]
    fn test_enqueue_defaults_throttle() {
        let cli = Cli::try_parse_from(["retrigger", "enqueue", "acme/widgets", "7"]).unwrap();
        match cli.command {
            Commands::Enqueue { throttle_secs, .. } => assert_eq!(throttle_secs, 0),
            _ => panic!("Expected enqueue command"),
        }
    }

    #[test]
    fn test_enqueue_rejects_bad_identifier() {
        assert!(Cli::try_parse_from(["retrigger", "enqueue", "acme/widgets", "abc"]).is_err());
    }

    #[test]
    fn test_prune_command() {
        let cli = Cli::try_parse_from(["retrigger", "prune", "--days", "7"]).unwrap();
        match cli.command {
            Commands::Prune { days } => assert_eq!(days, 7),
            _ => panic!("Expected prune command"),
        }

        let cli = Cli::try_parse_from(["retrigger", "prune"]).unwrap();
        match cli.command {
            Commands::Prune { days } => assert_eq!(days, 30),
            _ => panic!("Expected prune command"),
        }
    }
}
