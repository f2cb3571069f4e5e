// Local crates
use crate::config::config::BeaverConfig;
use crate::transports::transport::TransportError;

// External crates
use serde_json::{json, Map, Value};

/// The two accepted envelope generations at the sink boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogstashVersion {
    V0,
    V1,
}

impl LogstashVersion {
    pub fn from_config(value: Option<i64>) -> Result<Self, TransportError> {
        match value {
            Some(0) => Ok(Self::V0),
            Some(1) => Ok(Self::V1),
            other => Err(TransportError::Config(format!(
                "logstash_version must be 0 or 1, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    Json,
    Raw,
    KeyValue,
}

/// Serializes one line into the configured wire shape.
#[derive(Debug, Clone)]
pub struct Formatter {
    format: MessageFormat,
    version: LogstashVersion,
    hostname: String,
}

impl Formatter {
    pub fn new(format: MessageFormat, version: LogstashVersion) -> Self {
        Self {
            format,
            version,
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }

    pub fn from_config(config: &BeaverConfig) -> Result<Self, TransportError> {
        let version = LogstashVersion::from_config(config.beaver.logstash_version)?;
        let format = match config.beaver.format.as_str() {
            "json" => MessageFormat::Json,
            "raw" => MessageFormat::Raw,
            "kv" => MessageFormat::KeyValue,
            other => {
                return Err(TransportError::Config(format!(
                    "format must be one of json, raw, kv, got `{other}`"
                )))
            }
        };
        Ok(Self::new(format, version))
    }

    pub fn format(&self, filename: &str, line: &str, timestamp: &str, fields: &[String]) -> String {
        match self.format {
            MessageFormat::Raw => line.to_string(),
            MessageFormat::Json => self.json_envelope(filename, line, timestamp, fields),
            MessageFormat::KeyValue => self.kv_envelope(filename, line, timestamp, fields),
        }
    }

    fn json_envelope(&self, filename: &str, line: &str, timestamp: &str, fields: &[String]) -> String {
        let envelope = match self.version {
            LogstashVersion::V0 => json!({
                "@message": line,
                "@timestamp": timestamp,
                "@source": filename,
                "@fields": fields_map(fields),
            }),
            LogstashVersion::V1 => json!({
                "message": line,
                "@timestamp": timestamp,
                "host": self.hostname,
                "fields": fields_map(fields),
            }),
        };
        envelope.to_string()
    }

    fn kv_envelope(&self, filename: &str, line: &str, timestamp: &str, fields: &[String]) -> String {
        let mut out = format!(
            "message={} timestamp={} source={}",
            quote(line),
            quote(timestamp),
            quote(filename)
        );
        for (key, value) in fields.iter().map(|f| split_field(f)) {
            out.push(' ');
            out.push_str(&key);
            out.push('=');
            out.push_str(&quote(&value));
        }
        out
    }
}

/// `key=value` entries rendered as a JSON map; entries without `=` become
/// bare flags with an empty value.
fn fields_map(fields: &[String]) -> Value {
    let mut map = Map::new();
    for field in fields {
        let (key, value) = split_field(field);
        map.insert(key, Value::String(value));
    }
    Value::Object(map)
}

fn split_field(field: &str) -> (String, String) {
    match field.split_once('=') {
        Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
        None => (field.trim().to_string(), String::new()),
    }
}

fn quote(value: &str) -> String {
    if value.contains(' ') || value.contains('"') {
        format!("{:?}", value)
    } else {
        value.to_string()
    }
}
