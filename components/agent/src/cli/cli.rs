// Local crates
use crate::config::config::{BeaverConfig, CliOverrides};
use crate::instrumentation::tracing::init_tracing;
use crate::runtime;
use crate::transports::TransportRegistry;

// External crates
use clap::Parser;
use std::path::PathBuf;
use tracing::error;

#[derive(Parser, Debug)]
#[command(
    name = "beaver",
    version,
    about = "Log-shipping agent: tails files and forwards batched lines to pluggable sinks",
    after_help = "EXAMPLES:\n    \
        beaver --files /var/log/syslog --transport file --configfile beaver.toml\n    \
        beaver --path /var/log --transport sqs --logstash-version 1"
)]
pub struct Cli {
    /// Explicit files or glob patterns to tail
    #[arg(long = "files", value_name = "PATH", num_args = 1..)]
    files: Vec<String>,

    /// Directory to scan for *.log files when no patterns are given
    #[arg(long, value_name = "DIR")]
    path: Option<PathBuf>,

    /// Sink to deliver batches to (file, sqs, kinesis, ...)
    #[arg(long, value_name = "NAME")]
    transport: Option<String>,

    /// Wire format: json, raw, or kv
    #[arg(long, value_name = "FMT")]
    format: Option<String>,

    /// Agent configuration file
    #[arg(long = "configfile", short = 'c', value_name = "PATH")]
    configfile: Option<PathBuf>,

    /// Logging configuration file
    #[arg(long = "logging-config", value_name = "PATH")]
    logging_config: Option<PathBuf>,

    /// Envelope generation at the sink boundary
    #[arg(long = "logstash-version", value_name = "VERSION", value_parser = clap::value_parser!(i64).range(0..=1))]
    logstash_version: Option<i64>,
}

/// Parse the command line, wire the agent together, and run it to
/// completion. Returns the process exit code; configuration problems
/// print the offending option and exit nonzero.
pub async fn run() -> i32 {
    let cli = Cli::parse();

    let _appender_guard = match init_tracing(cli.logging_config.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("beaver: {e:#}");
            return 1;
        }
    };

    let overrides = CliOverrides {
        files: cli.files,
        path: cli.path,
        transport: cli.transport,
        format: cli.format,
        logstash_version: cli.logstash_version,
    };
    let config = match BeaverConfig::load(cli.configfile.as_deref(), overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("beaver: {e}");
            return 1;
        }
    };

    match runtime::runtime::run(config.into(), TransportRegistry::builtin(), None).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Agent failed");
            eprintln!("beaver: {e:#}");
            1
        }
    }
}
