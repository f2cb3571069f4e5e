// External crates
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncrypterError {
    /// Startup-time misconfiguration; names the offending option.
    #[error("encrypter configuration error: {0}")]
    Config(String),
    /// Failure inside the external materials provider.
    #[error("encryption provider failure: {0}")]
    Provider(String),
}

/// Optional per-file payload transform applied before the sink.
///
/// Implementations must be inverse pairs (`decrypt(encrypt(m)) == m`) and
/// should emit printable/armored output so line-oriented sinks can carry
/// the result.
pub trait Encrypter: Send + Sync {
    fn encrypt(&self, message: &[u8]) -> Result<Vec<u8>, EncrypterError>;
    fn decrypt(&self, message: &[u8]) -> Result<Vec<u8>, EncrypterError>;
}

/// The default transform: passes messages through untouched.
#[derive(Debug, Default)]
pub struct IdentityEncrypter;

impl Encrypter for IdentityEncrypter {
    fn encrypt(&self, message: &[u8]) -> Result<Vec<u8>, EncrypterError> {
        Ok(message.to_vec())
    }

    fn decrypt(&self, message: &[u8]) -> Result<Vec<u8>, EncrypterError> {
        Ok(message.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_arbitrary_bytes() {
        let encrypter = IdentityEncrypter;
        for message in [&b"hello"[..], &[0u8, 255, 42, 7][..], &[][..]] {
            let encrypted = encrypter.encrypt(message).unwrap();
            assert_eq!(encrypter.decrypt(&encrypted).unwrap(), message);
        }
    }
}
