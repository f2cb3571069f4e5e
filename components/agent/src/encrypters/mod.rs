pub mod encrypter;
pub mod kms;

// Local crates
use crate::config::config::BeaverConfig;
use crate::encrypters::encrypter::{Encrypter, EncrypterError, IdentityEncrypter};
use crate::encrypters::kms::{KmsEncrypter, ProviderFactory};

// External crates
use std::sync::Arc;

/// Select an encrypter by name. `default` (or no name) is the identity
/// transform; `kms` needs a linked materials provider from the embedding
/// application. Unknown names and missing providers are configuration
/// errors surfaced at startup.
pub fn create_encrypter(
    name: Option<&str>,
    config: &BeaverConfig,
    filename: &str,
    kms_provider: Option<&ProviderFactory>,
) -> Result<Arc<dyn Encrypter>, EncrypterError> {
    match name.unwrap_or("default") {
        "default" => Ok(Arc::new(IdentityEncrypter)),
        "kms" | "KMS" => {
            let factory = kms_provider.ok_or_else(|| {
                EncrypterError::Config(
                    "encrypter `kms` requires a key-management provider; none is linked"
                        .to_string(),
                )
            })?;
            Ok(KmsEncrypter::get_instance(config, filename, factory)? as Arc<dyn Encrypter>)
        }
        other => Err(EncrypterError::Config(format!(
            "unknown encrypter `{other}`"
        ))),
    }
}
