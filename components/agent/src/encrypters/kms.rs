// Local crates
use crate::config::config::{BeaverConfig, KmsSettings};
use crate::encrypters::encrypter::{Encrypter, EncrypterError};

// External crates
use lazy_static::lazy_static;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The external key-management interface. The concrete provider (the
/// service client plus its cryptographic materials manager) lives outside
/// the agent; `cache_capacity` and `cache_age` size its data-key cache.
pub trait MasterKeyProvider: Send + Sync {
    fn encrypt(
        &self,
        plaintext: &[u8],
        key_ids: &[String],
        context: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, EncrypterError>;

    fn decrypt(
        &self,
        ciphertext: &[u8],
        key_ids: &[String],
        context: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, EncrypterError>;
}

pub type ProviderFactory =
    Arc<dyn Fn(&KmsKey) -> Result<Arc<dyn MasterKeyProvider>, EncrypterError> + Send + Sync>;

/// Structural identity of one KMS configuration. Key ids and context pairs
/// are order-insensitive: the sorted collections make reordered input hash
/// and compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KmsKey {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub key_ids: BTreeSet<String>,
    pub encryption_context: BTreeMap<String, String>,
    pub cache_capacity: usize,
    pub cache_age: Duration,
}

impl KmsKey {
    pub fn from_settings(settings: &KmsSettings) -> Result<Self, EncrypterError> {
        let key_ids: BTreeSet<String> = settings
            .key_ids
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        if key_ids.is_empty() {
            return Err(EncrypterError::Config(
                "aws_kms_key_ids must name at least one master key".to_string(),
            ));
        }

        let mut encryption_context = BTreeMap::new();
        if let Some(raw) = settings.encryption_context.as_deref() {
            for item in raw.split(',').filter(|item| !item.trim().is_empty()) {
                let mut parts = item.splitn(2, '=');
                match (parts.next(), parts.next()) {
                    (Some(key), Some(value)) if !key.trim().is_empty() => {
                        encryption_context
                            .insert(key.trim().to_string(), value.trim().to_string());
                    }
                    _ => {
                        return Err(EncrypterError::Config(
                            "aws_kms_encryption_context must be a comma list of key=value pairs"
                                .to_string(),
                        ))
                    }
                }
            }
        }

        Ok(Self {
            access_key: settings.access_key.clone(),
            secret_key: settings.secret_key.clone(),
            key_ids,
            encryption_context,
            cache_capacity: settings.cache_capacity.unwrap_or(100),
            cache_age: Duration::from_secs(settings.cache_age_seconds.unwrap_or(300)),
        })
    }
}

lazy_static! {
    // Providers are expensive to build, so encrypter instances are shared
    // process-wide by structural key. The lock only covers lookup+insert.
    static ref INSTANCE_CACHE: Mutex<HashMap<KmsKey, Arc<KmsEncrypter>>> =
        Mutex::new(HashMap::new());
}

/// Payload transform backed by an external key-management provider.
pub struct KmsEncrypter {
    key: KmsKey,
    provider: Arc<dyn MasterKeyProvider>,
}

impl std::fmt::Debug for KmsEncrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsEncrypter")
            .field("key_ids", &self.key.key_ids)
            .finish_non_exhaustive()
    }
}

impl KmsEncrypter {
    /// Shared-instance constructor: equal keys always resolve to the same
    /// instance within a process.
    pub fn get_instance(
        config: &BeaverConfig,
        filename: &str,
        factory: &ProviderFactory,
    ) -> Result<Arc<Self>, EncrypterError> {
        let key = KmsKey::from_settings(&config.kms_for(filename))?;

        let mut cache = INSTANCE_CACHE
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = cache.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let provider = factory(&key)?;
        let instance = Arc::new(Self {
            key: key.clone(),
            provider,
        });
        cache.insert(key, Arc::clone(&instance));
        Ok(instance)
    }

    fn key_ids(&self) -> Vec<String> {
        self.key.key_ids.iter().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn cache_len() -> usize {
        INSTANCE_CACHE
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    #[cfg(test)]
    pub(crate) fn clear_cache() {
        INSTANCE_CACHE
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl Encrypter for KmsEncrypter {
    fn encrypt(&self, message: &[u8]) -> Result<Vec<u8>, EncrypterError> {
        self.provider
            .encrypt(message, &self.key_ids(), &self.key.encryption_context)
    }

    fn decrypt(&self, message: &[u8]) -> Result<Vec<u8>, EncrypterError> {
        self.provider
            .decrypt(message, &self.key_ids(), &self.key.encryption_context)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::config::CliOverrides;
    use std::io::Write;

    lazy_static! {
        // The instance cache is process-global; tests that touch it must
        // not interleave.
        static ref CACHE_TEST_LOCK: Mutex<()> = Mutex::new(());
    }

    /// Reversible stand-in for the external provider: prefixes the payload
    /// so encrypt/decrypt are distinguishable but lossless.
    #[derive(Debug)]
    pub(crate) struct ReversingProvider;

    impl MasterKeyProvider for ReversingProvider {
        fn encrypt(
            &self,
            plaintext: &[u8],
            _key_ids: &[String],
            _context: &BTreeMap<String, String>,
        ) -> Result<Vec<u8>, EncrypterError> {
            let mut out = b"enc:".to_vec();
            out.extend(plaintext.iter().rev());
            Ok(out)
        }

        fn decrypt(
            &self,
            ciphertext: &[u8],
            _key_ids: &[String],
            _context: &BTreeMap<String, String>,
        ) -> Result<Vec<u8>, EncrypterError> {
            let body = ciphertext
                .strip_prefix(b"enc:")
                .ok_or_else(|| EncrypterError::Provider("missing envelope prefix".to_string()))?;
            Ok(body.iter().rev().copied().collect())
        }
    }

    pub(crate) fn provider_factory() -> ProviderFactory {
        Arc::new(|_key: &KmsKey| Ok(Arc::new(ReversingProvider) as Arc<dyn MasterKeyProvider>))
    }

    fn config_with_kms(
        access: &str,
        secret: &str,
        key_ids: &str,
        context: &str,
        capacity: Option<usize>,
    ) -> BeaverConfig {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[beaver]\nlogstash_version = 1\n\
             aws_kms_access_key = \"{access}\"\naws_kms_secret_key = \"{secret}\"\n\
             aws_kms_key_ids = \"{key_ids}\"\naws_kms_encryption_context = \"{context}\"\n{}",
            capacity
                .map(|c| format!("aws_kms_cache_capacity = {c}"))
                .unwrap_or_default()
        )
        .unwrap();
        file.flush().unwrap();
        BeaverConfig::load(Some(file.path()), CliOverrides::default()).unwrap()
    }

    #[test]
    fn instances_are_cached_by_structural_key() {
        let _guard = CACHE_TEST_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        KmsEncrypter::clear_cache();
        let factory = provider_factory();

        // Same settings, repeated lookups: one instance.
        let config = config_with_kms("a", "b", "K1", "foo=bar", None);
        let first = KmsEncrypter::get_instance(&config, "foo.log", &factory).unwrap();
        let second = KmsEncrypter::get_instance(&config, "foo.log", &factory).unwrap();
        let third = KmsEncrypter::get_instance(&config, "foo.log", &factory).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(KmsEncrypter::cache_len(), 1);

        // A second key id grows the cache.
        let config = config_with_kms("a", "b", "K1,K1bar", "foo=bar", None);
        KmsEncrypter::get_instance(&config, "foo.log", &factory).unwrap();
        assert_eq!(KmsEncrypter::cache_len(), 2);

        // Reordering the key ids is a no-op.
        let config = config_with_kms("a", "b", "K1bar,K1", "foo=bar", None);
        KmsEncrypter::get_instance(&config, "foo.log", &factory).unwrap();
        assert_eq!(KmsEncrypter::cache_len(), 2);

        // Changing only the secret adds an instance.
        let config = config_with_kms("a", "c", "K1,K1bar", "foo=bar", None);
        KmsEncrypter::get_instance(&config, "foo.log", &factory).unwrap();
        assert_eq!(KmsEncrypter::cache_len(), 3);

        // So does a different context key.
        let config = config_with_kms("a", "c", "K1,K1bar", "foo2=bar", None);
        KmsEncrypter::get_instance(&config, "foo.log", &factory).unwrap();
        assert_eq!(KmsEncrypter::cache_len(), 4);

        // And a different cache capacity.
        let config = config_with_kms("a", "c", "K1,K1bar", "foo2=bar", Some(10));
        KmsEncrypter::get_instance(&config, "foo.log", &factory).unwrap();
        assert_eq!(KmsEncrypter::cache_len(), 5);
    }

    #[test]
    fn encrypt_then_decrypt_is_identity() {
        let _guard = CACHE_TEST_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        KmsEncrypter::clear_cache();
        let config = config_with_kms("a", "b", "RoundTripKey", "foo=bar", None);
        let encrypter =
            KmsEncrypter::get_instance(&config, "rt.log", &provider_factory()).unwrap();

        for message in [&b"Hello World"[..], &[0u8, 1, 2, 254, 255][..], &[][..]] {
            let encrypted = encrypter.encrypt(message).unwrap();
            assert_ne!(encrypted, message);
            assert_eq!(encrypter.decrypt(&encrypted).unwrap(), message);
        }
    }

    #[test]
    fn missing_key_ids_is_a_config_error() {
        let settings = KmsSettings::default();
        assert!(matches!(
            KmsKey::from_settings(&settings),
            Err(EncrypterError::Config(_))
        ));
    }

    #[test]
    fn malformed_context_is_a_config_error() {
        let settings = KmsSettings {
            key_ids: Some("K1".to_string()),
            encryption_context: Some("not-a-pair".to_string()),
            ..KmsSettings::default()
        };
        assert!(matches!(
            KmsKey::from_settings(&settings),
            Err(EncrypterError::Config(_))
        ));
    }
}
