//! Encryption facade. The actual primitives (symmetric/asymmetric boxes,
//! AES-GCM) live outside this crate; callers hand us a [`BoxCrypto`]
//! capability per entity, and the registry caches lookups so batched
//! decrypt paths don't re-derive keys per record.

use crate::error::{Error, Result};
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

/// Batched, order-preserving encryption capability.
///
/// `decrypt` yields one slot per ciphertext; `None` marks a tampered or
/// malformed item and is never an error, so a single bad record can't fail
/// a whole batch.
pub trait BoxCrypto: Send + Sync {
    fn encrypt(&self, items: &[Value]) -> Result<Vec<Vec<u8>>>;
    fn decrypt(&self, ciphertexts: &[Vec<u8>]) -> Result<Vec<Option<Value>>>;
    fn encrypt_blob(&self, bytes: &[u8]) -> Result<Vec<u8>>;
    fn decrypt_blob(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Constructs the encryptor for one entity (a session, a machine, the task
/// collection). Key material lookup happens here, outside this crate.
pub trait CryptoFactory: Send + Sync {
    fn open(&self, entity_id: &str) -> Result<Arc<dyn BoxCrypto>>;
}

/// Per-entity encryptor dispatch with an LRU cache in front of the factory.
pub struct CryptoRegistry {
    factory: Arc<dyn CryptoFactory>,
    cache: Mutex<LruCache<String, Arc<dyn BoxCrypto>>>,
}

impl CryptoRegistry {
    pub fn new(factory: Arc<dyn CryptoFactory>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            factory,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Resolve the encryptor for `entity_id`, constructing and caching it on
    /// first use.
    pub fn for_entity(&self, entity_id: &str) -> Result<Arc<dyn BoxCrypto>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(crypto) = cache.get(entity_id) {
            return Ok(Arc::clone(crypto));
        }
        let crypto = self.factory.open(entity_id)?;
        cache.put(entity_id.to_string(), Arc::clone(&crypto));
        Ok(crypto)
    }

    pub fn evict(&self, entity_id: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.pop(entity_id);
    }
}

impl std::fmt::Debug for CryptoRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoRegistry").finish_non_exhaustive()
    }
}

/// Encrypt a single JSON value. Convenience over the batched call.
pub fn encrypt_one(crypto: &dyn BoxCrypto, value: &Value) -> Result<Vec<u8>> {
    let mut out = crypto.encrypt(std::slice::from_ref(value))?;
    out.pop()
        .ok_or_else(|| Error::Crypto("encryptor returned no output".to_string()))
}

/// Decrypt a single ciphertext. `None` marks tamper, mirroring the batch API.
pub fn decrypt_one(crypto: &dyn BoxCrypto, ciphertext: &[u8]) -> Result<Option<Value>> {
    let mut out = crypto.decrypt(std::slice::from_ref(&ciphertext.to_vec()))?;
    out.pop()
        .ok_or_else(|| Error::Crypto("decryptor returned no output".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::PlainCrypto;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        opens: AtomicUsize,
    }

    impl CryptoFactory for CountingFactory {
        fn open(&self, _entity_id: &str) -> Result<Arc<dyn BoxCrypto>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(PlainCrypto))
        }
    }

    #[test]
    fn registry_caches_per_entity() {
        let factory = Arc::new(CountingFactory {
            opens: AtomicUsize::new(0),
        });
        let registry = CryptoRegistry::new(Arc::<CountingFactory>::clone(&factory), 8);

        registry.for_entity("session-1").unwrap();
        registry.for_entity("session-1").unwrap();
        assert_eq!(factory.opens.load(Ordering::SeqCst), 1);

        registry.for_entity("session-2").unwrap();
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);

        registry.evict("session-1");
        registry.for_entity("session-1").unwrap();
        assert_eq!(factory.opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn single_item_helpers_round_trip() {
        let value = json!({"hello": "world"});
        let bytes = encrypt_one(&PlainCrypto, &value).unwrap();
        assert_eq!(decrypt_one(&PlainCrypto, &bytes).unwrap(), Some(value));
        assert_eq!(decrypt_one(&PlainCrypto, b"garbage").unwrap(), None);
    }
}
