//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use tracing::Level;

use crate::logging::{LogConfig, LogFormat};
use crate::pool::JobSpec;

/// Process-based worker pool demo driver.
#[derive(Parser, Debug)]
#[command(name = "forkpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log output format: pretty, compact, json.
    #[arg(long, env = "FORKPOOL_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Translate the global flags into a logging configuration.
    pub fn log_config(&self) -> LogConfig {
        let level = if self.quiet {
            Level::ERROR
        } else {
            match self.verbose {
                0 => Level::INFO,
                1 => Level::DEBUG,
                _ => Level::TRACE,
            }
        };

        let format = match &self.log_format {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                eprintln!("Warning: {}", err);
                LogFormat::default()
            }),
            None => LogFormat::default(),
        };

        LogConfig::new()
            .with_level(level)
            .with_format(format)
            .with_env_overrides()
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fork a pool of workers and push jobs through it.
    Run(RunArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of worker processes to fork.
    #[arg(short, long, default_value_t = 4)]
    pub workers: usize,

    /// Job to dispatch, as NAME or NAME=PARAMS with PARAMS as JSON.
    /// May be given multiple times.
    #[arg(short, long = "job", value_name = "NAME[=PARAMS]")]
    pub jobs: Vec<String>,

    /// Seconds to keep draining worker notifications after the last
    /// dispatch.
    #[arg(long, default_value_t = 2)]
    pub linger: u64,
}

impl RunArgs {
    /// Parse every `--job` argument into a job spec.
    pub fn parsed_jobs(&self) -> crate::Result<Vec<JobSpec>> {
        self.jobs.iter().map(|raw| parse_job(raw)).collect()
    }
}

/// Parse `NAME` or `NAME=PARAMS` into a job spec.
fn parse_job(raw: &str) -> crate::Result<JobSpec> {
    match raw.split_once('=') {
        Some((name, params)) => Ok(JobSpec::with_params(name, serde_json::from_str(params)?)),
        None => Ok(JobSpec::new(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_job_bare_name() {
        let job = parse_job("greet").unwrap();
        assert_eq!(job.name(), "greet");
        assert!(job.params().is_null());
    }

    #[test]
    fn test_parse_job_with_params() {
        let job = parse_job(r#"sleep={"secs":2}"#).unwrap();
        assert_eq!(job.name(), "sleep");
        assert_eq!(job.params()["secs"], 2);
    }

    #[test]
    fn test_parse_job_rejects_bad_json() {
        assert!(parse_job("sleep={nope}").is_err());
    }

    #[test]
    fn test_verbosity_mapping() {
        let cli = Cli::parse_from(["forkpool", "-vv", "run"]);
        assert_eq!(cli.log_config().level, Level::TRACE);

        let cli = Cli::parse_from(["forkpool", "-q", "run"]);
        assert_eq!(cli.log_config().level, Level::ERROR);
    }
}
