use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, ensure};
use lru::LruCache;
use parking_lot::Mutex;
use rustls::sign::CertifiedKey;

use super::ca::CertificateAuthority;

/// Issues leaf certificates for intercepted hosts, memoizing minted keys in
/// an LRU so repeated CONNECTs to the same host skip key generation.
pub struct TlsIssuer {
    ca: Arc<CertificateAuthority>,
    cache: Mutex<LruCache<String, Arc<CertifiedKey>>>,
    ttl: Duration,
}

impl TlsIssuer {
    pub fn new(ca: Arc<CertificateAuthority>, capacity: usize, ttl: Duration) -> Result<Self> {
        ensure!(ttl > Duration::ZERO, "leaf ttl must be positive");
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| anyhow::anyhow!("certificate cache capacity must be non-zero"))?;
        Ok(Self {
            ca,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        })
    }

    pub fn issue(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        let key = host.to_ascii_lowercase();
        if let Some(found) = self.cache.lock().get(&key) {
            return Ok(found.clone());
        }
        let minted = self.ca.mint_leaf(&[host], self.ttl)?;
        self.cache.lock().put(key, minted.clone());
        Ok(minted)
    }
}
