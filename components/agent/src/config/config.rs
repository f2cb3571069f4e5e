// External crates
use glob::Pattern;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration failures are fatal at startup and always name the
/// offending option so the operator can fix the file or flag.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required option `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{option}`: {reason}")]
    Invalid { option: String, reason: String },
}

/// The `[beaver]` table: global settings for the whole agent.
///
/// Missing keys take the defaults below; transport- and KMS-specific keys
/// stay `None` until the matching sink or encrypter asks for them.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GlobalSection {
    pub logstash_version: Option<i64>,
    pub max_queue_size: usize,
    pub number_of_consumer_processes: usize,
    pub refresh_worker_process: Option<u64>,
    pub respawn_delay: f64,
    pub max_failure: u32,
    pub consumer_refresh_interval: f64,
    pub discover_interval: u64,
    pub ignore_old_files_days: u64,
    pub ignore_old_files_hours: u64,
    pub ignore_old_files_minutes: u64,
    pub sincedb_path: Option<PathBuf>,
    pub sincedb_write_interval: u64,
    pub buffered_lines_max_lines: Option<usize>,
    pub buffered_lines_max_bytes: Option<usize>,
    pub buffered_lines_max_seconds: Option<f64>,
    pub path: Option<PathBuf>,
    pub files: Vec<String>,
    pub transport: String,
    pub format: String,
    pub shutdown_timeout: f64,
    pub multiline_regex: Option<String>,
    pub multiline_negate: bool,
    pub multiline_flush_seconds: f64,
    pub fields: Vec<String>,
    pub encrypter: Option<String>,

    // SSH tunnel endpoint; the tunnel itself is provided externally.
    pub ssh_tunnel: Option<String>,
    pub ssh_tunnel_port: Option<u16>,
    pub ssh_remote_host: Option<String>,
    pub ssh_remote_port: Option<u16>,

    pub file_transport_output_path: Option<PathBuf>,

    pub sqs_aws_region: Option<String>,
    pub sqs_aws_queue: Option<String>,
    pub sqs_aws_access_key: Option<String>,
    pub sqs_aws_secret_key: Option<String>,
    pub sqs_bulk_lines: bool,
    pub sqs_bulk_size_max: usize,

    pub kinesis_aws_region: Option<String>,
    pub kinesis_aws_stream: Option<String>,
    pub kinesis_aws_access_key: Option<String>,
    pub kinesis_aws_secret_key: Option<String>,
    pub kinesis_aws_batch_size_max: usize,
    pub kinesis_max_retries: u32,
    pub kinesis_initial_backoff_millis: u64,

    pub aws_kms_access_key: Option<String>,
    pub aws_kms_secret_key: Option<String>,
    pub aws_kms_key_ids: Option<String>,
    pub aws_kms_encryption_context: Option<String>,
    pub aws_kms_cache_capacity: Option<usize>,
    pub aws_kms_cache_age_seconds: Option<u64>,
}

impl Default for GlobalSection {
    fn default() -> Self {
        Self {
            logstash_version: None,
            max_queue_size: 100,
            number_of_consumer_processes: 1,
            refresh_worker_process: None,
            respawn_delay: 3.0,
            max_failure: 3,
            consumer_refresh_interval: 5.0,
            discover_interval: 15,
            ignore_old_files_days: 0,
            ignore_old_files_hours: 0,
            ignore_old_files_minutes: 0,
            sincedb_path: None,
            sincedb_write_interval: 5,
            buffered_lines_max_lines: None,
            buffered_lines_max_bytes: None,
            buffered_lines_max_seconds: None,
            path: None,
            files: Vec::new(),
            transport: "file".to_string(),
            format: "json".to_string(),
            shutdown_timeout: 60.0,
            multiline_regex: None,
            multiline_negate: false,
            multiline_flush_seconds: 1.0,
            fields: Vec::new(),
            encrypter: None,
            ssh_tunnel: None,
            ssh_tunnel_port: None,
            ssh_remote_host: None,
            ssh_remote_port: None,
            file_transport_output_path: None,
            sqs_aws_region: None,
            sqs_aws_queue: None,
            sqs_aws_access_key: None,
            sqs_aws_secret_key: None,
            sqs_bulk_lines: false,
            sqs_bulk_size_max: 250_000,
            kinesis_aws_region: None,
            kinesis_aws_stream: None,
            kinesis_aws_access_key: None,
            kinesis_aws_secret_key: None,
            kinesis_aws_batch_size_max: 512_000,
            kinesis_max_retries: 3,
            kinesis_initial_backoff_millis: 10,
            aws_kms_access_key: None,
            aws_kms_secret_key: None,
            aws_kms_key_ids: None,
            aws_kms_encryption_context: None,
            aws_kms_cache_capacity: None,
            aws_kms_cache_age_seconds: None,
        }
    }
}

/// A `[globs."<pattern>"]` table: one watched pattern with its exclusions
/// and any per-file overrides of the global settings.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GlobSection {
    pub exclude: Vec<String>,
    pub fields: Option<Vec<String>>,
    pub encrypter: Option<String>,
    pub multiline_regex: Option<String>,
    pub multiline_negate: Option<bool>,
    pub multiline_flush_seconds: Option<f64>,
    pub aws_kms_access_key: Option<String>,
    pub aws_kms_secret_key: Option<String>,
    pub aws_kms_key_ids: Option<String>,
    pub aws_kms_encryption_context: Option<String>,
    pub aws_kms_cache_capacity: Option<usize>,
    pub aws_kms_cache_age_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    beaver: GlobalSection,
    globs: HashMap<String, GlobSection>,
}

/// Multiline merge policy resolved for one file.
#[derive(Debug, Clone)]
pub struct MultilineSettings {
    pub regex: String,
    pub negate: bool,
    pub flush_after: Duration,
}

/// KMS settings resolved for one file (per-section value wins over the
/// global one, field by field).
#[derive(Debug, Clone, Default)]
pub struct KmsSettings {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub key_ids: Option<String>,
    pub encryption_context: Option<String>,
    pub cache_capacity: Option<usize>,
    pub cache_age_seconds: Option<u64>,
}

/// Values parsed from the command line that override the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub files: Vec<String>,
    pub path: Option<PathBuf>,
    pub transport: Option<String>,
    pub format: Option<String>,
    pub logstash_version: Option<i64>,
}

/// Loaded, merged, and validated agent configuration.
#[derive(Debug)]
pub struct BeaverConfig {
    pub beaver: GlobalSection,
    globs: HashMap<String, GlobSection>,
    // Compiled once so per-file lookups stay cheap in the tail loop.
    compiled: Vec<(Pattern, String)>,
}

impl BeaverConfig {
    pub fn load(config_path: Option<&Path>, overrides: CliOverrides) -> Result<Self, ConfigError> {
        let parsed = match config_path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str::<ConfigFile>(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => ConfigFile::default(),
        };

        let mut beaver = parsed.beaver;
        if !overrides.files.is_empty() {
            beaver.files = overrides.files;
        }
        if let Some(path) = overrides.path {
            beaver.path = Some(path);
        }
        if let Some(transport) = overrides.transport {
            beaver.transport = transport;
        }
        if let Some(format) = overrides.format {
            beaver.format = format;
        }
        if let Some(version) = overrides.logstash_version {
            beaver.logstash_version = Some(version);
        }

        let mut compiled = Vec::with_capacity(parsed.globs.len());
        for pattern in parsed.globs.keys() {
            let glob = Pattern::new(pattern).map_err(|e| ConfigError::Invalid {
                option: format!("globs.\"{pattern}\""),
                reason: e.to_string(),
            })?;
            compiled.push((glob, pattern.clone()));
        }

        let config = Self {
            beaver,
            globs: parsed.globs,
            compiled,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.beaver.logstash_version {
            Some(0) | Some(1) => {}
            Some(other) => {
                return Err(ConfigError::Invalid {
                    option: "logstash_version".to_string(),
                    reason: format!("must be 0 or 1, got {other}"),
                })
            }
            None => return Err(ConfigError::Missing("logstash_version")),
        }
        match self.beaver.format.as_str() {
            "json" | "raw" | "kv" => {}
            other => {
                return Err(ConfigError::Invalid {
                    option: "format".to_string(),
                    reason: format!("unknown format `{other}`"),
                })
            }
        }
        if self.beaver.max_queue_size == 0 {
            return Err(ConfigError::Invalid {
                option: "max_queue_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.beaver.number_of_consumer_processes == 0 {
            return Err(ConfigError::Invalid {
                option: "number_of_consumer_processes".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// The watched patterns with their exclusions: explicit `files` entries
    /// (no exclusions) followed by the configured glob sections.
    pub fn watch_patterns(&self) -> Vec<(String, Vec<String>)> {
        let mut patterns: Vec<(String, Vec<String>)> = self
            .beaver
            .files
            .iter()
            .map(|f| (f.clone(), Vec::new()))
            .collect();
        let mut sections: Vec<_> = self.globs.iter().collect();
        sections.sort_by(|a, b| a.0.cmp(b.0));
        for (pattern, section) in sections {
            patterns.push((pattern.clone(), section.exclude.clone()));
        }
        patterns
    }

    /// Per-file section lookup: an exact key match first, then the first
    /// glob pattern that matches the filename.
    fn section_for(&self, filename: &str) -> Option<&GlobSection> {
        if let Some(section) = self.globs.get(filename) {
            return Some(section);
        }
        self.compiled
            .iter()
            .find(|(glob, _)| glob.matches(filename))
            .and_then(|(_, key)| self.globs.get(key))
    }

    pub fn fields_for(&self, filename: &str) -> Vec<String> {
        self.section_for(filename)
            .and_then(|s| s.fields.clone())
            .unwrap_or_else(|| self.beaver.fields.clone())
    }

    pub fn encrypter_for(&self, filename: &str) -> Option<String> {
        self.section_for(filename)
            .and_then(|s| s.encrypter.clone())
            .or_else(|| self.beaver.encrypter.clone())
    }

    pub fn multiline_for(&self, filename: &str) -> Option<MultilineSettings> {
        let section = self.section_for(filename);
        let regex = section
            .and_then(|s| s.multiline_regex.clone())
            .or_else(|| self.beaver.multiline_regex.clone())?;
        let negate = section
            .and_then(|s| s.multiline_negate)
            .unwrap_or(self.beaver.multiline_negate);
        let flush_seconds = section
            .and_then(|s| s.multiline_flush_seconds)
            .unwrap_or(self.beaver.multiline_flush_seconds);
        Some(MultilineSettings {
            regex,
            negate,
            flush_after: Duration::from_secs_f64(flush_seconds),
        })
    }

    pub fn kms_for(&self, filename: &str) -> KmsSettings {
        let section = self.section_for(filename);
        KmsSettings {
            access_key: section
                .and_then(|s| s.aws_kms_access_key.clone())
                .or_else(|| self.beaver.aws_kms_access_key.clone()),
            secret_key: section
                .and_then(|s| s.aws_kms_secret_key.clone())
                .or_else(|| self.beaver.aws_kms_secret_key.clone()),
            key_ids: section
                .and_then(|s| s.aws_kms_key_ids.clone())
                .or_else(|| self.beaver.aws_kms_key_ids.clone()),
            encryption_context: section
                .and_then(|s| s.aws_kms_encryption_context.clone())
                .or_else(|| self.beaver.aws_kms_encryption_context.clone()),
            cache_capacity: section
                .and_then(|s| s.aws_kms_cache_capacity)
                .or(self.beaver.aws_kms_cache_capacity),
            cache_age_seconds: section
                .and_then(|s| s.aws_kms_cache_age_seconds)
                .or(self.beaver.aws_kms_cache_age_seconds),
        }
    }

    pub fn discover_interval(&self) -> Duration {
        Duration::from_secs(self.beaver.discover_interval)
    }

    pub fn sincedb_write_interval(&self) -> Duration {
        Duration::from_secs(self.beaver.sincedb_write_interval)
    }

    pub fn respawn_delay(&self) -> Duration {
        Duration::from_secs_f64(self.beaver.respawn_delay)
    }

    pub fn consumer_refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(self.beaver.consumer_refresh_interval)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.beaver.shutdown_timeout)
    }

    /// The mtime floor for discovery, or `None` when no ignore window is
    /// configured.
    pub fn ignore_old_files(&self) -> Option<chrono::Duration> {
        let days = self.beaver.ignore_old_files_days;
        let hours = self.beaver.ignore_old_files_hours;
        let minutes = self.beaver.ignore_old_files_minutes;
        if days == 0 && hours == 0 && minutes == 0 {
            return None;
        }
        Some(
            chrono::Duration::days(days as i64)
                + chrono::Duration::hours(hours as i64)
                + chrono::Duration::minutes(minutes as i64),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn rejects_invalid_logstash_version() {
        let file = write_config("[beaver]\nlogstash_version = 2\n");
        let err = BeaverConfig::load(Some(file.path()), CliOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { option, .. } if option == "logstash_version"));
    }

    #[test]
    fn requires_logstash_version() {
        let file = write_config("[beaver]\nmax_queue_size = 10\n");
        let err = BeaverConfig::load(Some(file.path()), CliOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("logstash_version")));
    }

    #[test]
    fn cli_overrides_win() {
        let file = write_config("[beaver]\nlogstash_version = 0\ntransport = \"sqs\"\n");
        let overrides = CliOverrides {
            transport: Some("file".to_string()),
            logstash_version: Some(1),
            ..CliOverrides::default()
        };
        let config = BeaverConfig::load(Some(file.path()), overrides).unwrap();
        assert_eq!(config.beaver.transport, "file");
        assert_eq!(config.beaver.logstash_version, Some(1));
    }

    #[test]
    fn per_file_section_overrides_global() {
        let file = write_config(
            "[beaver]\n\
             logstash_version = 1\n\
             fields = [\"env=prod\"]\n\
             [globs.\"/var/log/app/*.log\"]\n\
             exclude = [\"*.gz\"]\n\
             fields = [\"env=staging\", \"team=infra\"]\n\
             encrypter = \"kms\"\n",
        );
        let config = BeaverConfig::load(Some(file.path()), CliOverrides::default()).unwrap();
        assert_eq!(
            config.fields_for("/var/log/app/web.log"),
            vec!["env=staging".to_string(), "team=infra".to_string()]
        );
        assert_eq!(config.fields_for("/tmp/other.log"), vec!["env=prod".to_string()]);
        assert_eq!(
            config.encrypter_for("/var/log/app/web.log").as_deref(),
            Some("kms")
        );
        assert_eq!(config.encrypter_for("/tmp/other.log"), None);
        let patterns = config.watch_patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].1, vec!["*.gz".to_string()]);
    }

    #[test]
    fn kms_settings_resolve_per_file_then_global() {
        let file = write_config(
            "[beaver]\n\
             logstash_version = 1\n\
             aws_kms_access_key = \"global-access\"\n\
             aws_kms_key_ids = \"k1\"\n\
             [globs.\"/srv/*.log\"]\n\
             aws_kms_key_ids = \"k2,k3\"\n",
        );
        let config = BeaverConfig::load(Some(file.path()), CliOverrides::default()).unwrap();
        let kms = config.kms_for("/srv/db.log");
        assert_eq!(kms.access_key.as_deref(), Some("global-access"));
        assert_eq!(kms.key_ids.as_deref(), Some("k2,k3"));
        assert_eq!(config.kms_for("/tmp/a.log").key_ids.as_deref(), Some("k1"));
    }
}
