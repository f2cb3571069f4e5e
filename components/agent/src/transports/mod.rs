pub mod file;
pub mod formatter;
pub mod kinesis;
pub mod sqs;
pub mod transport;

// Local crates
use crate::config::config::BeaverConfig;
use crate::transports::file::FileTransport;
use crate::transports::transport::{Transport, TransportError};

// External crates
use std::collections::HashMap;

pub type TransportFactory =
    Box<dyn Fn(&BeaverConfig) -> Result<Box<dyn Transport>, TransportError> + Send + Sync>;

/// Name-to-constructor table, decided once at startup.
///
/// `file` is fully self-contained. `sqs` and `kinesis` need their external
/// service clients; an embedding application registers constructors that
/// close over real clients (and, for the stream sink, the termination
/// event), replacing the placeholders that surface a configuration error
/// when those sinks are selected without one.
pub struct TransportRegistry {
    constructors: HashMap<String, TransportFactory>,
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TransportRegistry").field("names", &names).finish()
    }
}

impl TransportRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register("file", |config| {
            Ok(Box::new(FileTransport::new(config)?) as Box<dyn Transport>)
        });
        registry.register("sqs", |_| {
            Err(TransportError::Config(
                "transport `sqs` requires a queue-service client; none is linked".to_string(),
            ))
        });
        registry.register("kinesis", |_| {
            Err(TransportError::Config(
                "transport `kinesis` requires a stream-service client; none is linked".to_string(),
            ))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&BeaverConfig) -> Result<Box<dyn Transport>, TransportError> + Send + Sync + 'static,
    {
        self.constructors.insert(name.to_string(), Box::new(factory));
    }

    pub fn create(
        &self,
        name: &str,
        config: &BeaverConfig,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let factory = self.constructors.get(name).ok_or_else(|| {
            TransportError::Config(format!("unknown transport `{name}`"))
        })?;
        factory(config)
    }
}
