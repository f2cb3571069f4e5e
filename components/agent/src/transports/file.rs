// Local crates
use crate::config::config::BeaverConfig;
use crate::transports::formatter::Formatter;
use crate::transports::transport::{Transport, TransportError};

// External crates
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// Appends every formatted line to a local file, fsyncing per line.
/// Mostly used for integration tests and as the simplest possible sink.
#[derive(Debug)]
pub struct FileTransport {
    path: PathBuf,
    formatter: Formatter,
}

impl FileTransport {
    pub fn new(config: &BeaverConfig) -> Result<Self, TransportError> {
        let path = config
            .beaver
            .file_transport_output_path
            .clone()
            .ok_or_else(|| {
                TransportError::Config("file_transport_output_path is not set".to_string())
            })?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(TransportError::Config(format!(
                    "file_transport_output_path: directory {} does not exist",
                    parent.display()
                )));
            }
        }
        Ok(Self {
            path,
            formatter: Formatter::from_config(config)?,
        })
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn send(
        &mut self,
        filename: &str,
        lines: &[String],
        fields: &[String],
        timestamp: &str,
    ) -> Result<(), TransportError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TransportError::Retry(format!("open {}: {e}", self.path.display())))?;

        for line in lines {
            let formatted = self.formatter.format(filename, line, timestamp, fields);
            file.write_all(formatted.as_bytes())
                .and_then(|_| file.write_all(b"\n"))
                .and_then(|_| file.sync_all())
                .map_err(|e| TransportError::Retry(format!("write {}: {e}", self.path.display())))?;
        }
        Ok(())
    }
}
