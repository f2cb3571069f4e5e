// External crates
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// The `--logging-config` file. Everything is optional; the defaults are
/// a plain text layer on stderr at `info`.
///
/// `prefix` injects a literal tag between the timestamp and the message
/// of every line (text format only) so downstream log processors can
/// pick the agent's own output apart from whatever it ships.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub file: Option<PathBuf>,
    pub format: Option<String>,
    pub prefix: Option<String>,
}

struct PrefixedFormat {
    prefix: String,
}

impl<S, N> FormatEvent<S, N> for PrefixedFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        write!(
            writer,
            "{} {} ",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            self.prefix
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber. Returns the appender guard when logs go
/// to a file; the caller keeps it alive for the life of the process so
/// buffered lines are flushed on exit.
pub fn init_tracing(logging_config: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let settings = match logging_config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading logging config {}", path.display()))?;
            toml::from_str::<LoggingSettings>(&raw)
                .with_context(|| format!("parsing logging config {}", path.display()))?
        }
        None => LoggingSettings::default(),
    };

    let filter = match settings.level.as_deref() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let json = settings.format.as_deref() == Some("json");

    let mut guard = None;
    let layer = match &settings.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .context("logging `file` must name a file")?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, appender_guard) = tracing_appender::non_blocking(appender);
            guard = Some(appender_guard);
            build_layer(writer, json, settings.prefix, false)
        }
        None => build_layer(std::io::stderr, json, settings.prefix, true),
    };

    Registry::default().with(filter).with(layer).try_init().ok();
    Ok(guard)
}

fn build_layer<S, W>(
    writer: W,
    json: bool,
    prefix: Option<String>,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .boxed()
    } else if let Some(prefix) = prefix {
        fmt::layer()
            .event_format(PrefixedFormat { prefix })
            .with_writer(writer)
            .with_ansi(false)
            .boxed()
    } else {
        fmt::layer().with_writer(writer).with_ansi(ansi).boxed()
    }
}
