//! In-memory revocation evidence cache shared by concurrent signing runs.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use crate::certs;

/// Kind of a piece of evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum EvidenceKind {
    /// DER `OCSPResponse`
    Ocsp,
    /// DER `CertificateList`
    Crl,
}

/// One OCSP response or CRL proving a certificate was not revoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceItem {
    /// OCSP or CRL
    pub kind: EvidenceKind,
    /// DER bytes as received
    pub der: Vec<u8>,
    /// `thisUpdate` of the response or CRL
    pub this_update: SystemTime,
    /// `nextUpdate`, when the producer set one
    pub next_update: Option<SystemTime>,
    /// URL it was fetched from
    pub source: String,
    /// Certificates needed to validate it (delegated OCSP responder)
    pub supporting_certs: Vec<Vec<u8>>,
}

struct CacheEntry {
    item: EvidenceItem,
    expires: SystemTime,
}

const SHARDS: usize = 16;

/// Evidence keyed by `fingerprint(cert):fingerprint(issuer)`.
///
/// Split across shards, each behind its own `RwLock`. An entry is only
/// replaced by a strictly fresher one (later `thisUpdate`) and is dropped
/// once past `nextUpdate`, or past the TTL when there is none.
pub struct RevocationCache {
    shards: Vec<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl RevocationCache {
    /// Create an empty cache. `ttl` applies to evidence without `nextUpdate`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            ttl,
        }
    }

    /// Cache key for `cert` issued by `issuer` (both DER).
    pub fn key(cert: &[u8], issuer: &[u8]) -> String {
        format!("{}:{}", certs::fingerprint(cert), certs::fingerprint(issuer))
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, CacheEntry>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (SHARDS - 1)]
    }

    /// Live evidence for `key` at `now`.
    pub fn get(&self, key: &str, now: SystemTime) -> Option<EvidenceItem> {
        let shard = self.shard(key);
        {
            let map = shard.read().ok()?;
            match map.get(key) {
                Some(entry) if entry.expires > now => return Some(entry.item.clone()),
                Some(_) => {},
                None => return None,
            }
        }
        if let Ok(mut map) = shard.write() {
            if map.get(key).is_some_and(|e| e.expires <= now) {
                map.remove(key);
                log::debug!("Evicted expired revocation evidence {}", key);
            }
        }
        None
    }

    /// Store `item` unless an entry at least as fresh is present. Returns
    /// whether it was stored.
    pub fn insert(&self, key: &str, item: EvidenceItem, now: SystemTime) -> bool {
        let expires = item.next_update.unwrap_or(now + self.ttl);
        if expires <= now {
            return false;
        }
        let Ok(mut map) = self.shard(key).write() else {
            return false;
        };
        match map.get(key) {
            Some(existing) if existing.expires > now && existing.item.this_update >= item.this_update => false,
            _ => {
                map.insert(key.to_string(), CacheEntry { item, expires });
                true
            },
        }
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().map(|m| m.len()).unwrap_or(0))
            .sum()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything.
    pub fn clear(&self) {
        for shard in &self.shards {
            if let Ok(mut map) = shard.write() {
                map.clear();
            }
        }
    }
}

impl Default for RevocationCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl std::fmt::Debug for RevocationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationCache")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(this_update: SystemTime, next_update: Option<SystemTime>, der: u8) -> EvidenceItem {
        EvidenceItem {
            kind: EvidenceKind::Ocsp,
            der: vec![der],
            this_update,
            next_update,
            source: "http://ocsp.test".to_string(),
            supporting_certs: Vec::new(),
        }
    }

    #[test]
    fn test_only_fresher_replaces() {
        let cache = RevocationCache::default();
        let now = SystemTime::now();
        let hour = Duration::from_secs(3600);
        assert!(cache.insert("k", item(now - hour, Some(now + hour), 1), now));
        assert!(!cache.insert("k", item(now - hour, Some(now + hour), 2), now));
        assert!(!cache.insert("k", item(now - 2 * hour, Some(now + hour), 3), now));
        assert_eq!(cache.get("k", now).unwrap().der, vec![1]);

        assert!(cache.insert("k", item(now, Some(now + hour), 4), now));
        assert_eq!(cache.get("k", now).unwrap().der, vec![4]);
    }

    #[test]
    fn test_expiry() {
        let cache = RevocationCache::new(Duration::from_secs(60));
        let now = SystemTime::now();
        assert!(cache.insert("a", item(now, Some(now + Duration::from_secs(10)), 1), now));
        assert!(cache.insert("b", item(now, None, 2), now));
        let later = now + Duration::from_secs(30);
        assert!(cache.get("a", later).is_none());
        assert!(cache.get("b", later).is_some());
        assert!(cache.get("b", now + Duration::from_secs(61)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_stale_evidence_is_not_stored() {
        let cache = RevocationCache::default();
        let now = SystemTime::now();
        let past = now - Duration::from_secs(5);
        assert!(!cache.insert("k", item(past, Some(past), 1), now));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_key_format() {
        let key = RevocationCache::key(b"cert", b"issuer");
        assert_eq!(key.len(), 64 * 2 + 1);
        assert_eq!(&key[64..65], ":");
    }
}
