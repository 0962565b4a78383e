/// Read-once TTL cache and the patient search decorator built on it.
///
/// An entry is populated on a miss and evicted by the next read of the same key,
/// so a result is served from memory at most once. Entries older than the TTL
/// are treated as absent.

use async_trait::async_trait;
use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clients::{MatchedPatient, PatientQuery, PatientSearch};
use crate::errors::PartnerError;

/// Bounded by `capacity`: storing into a full cache drops the least recently stored entry.
pub struct ReadOnceCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, (Instant, V)>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V> ReadOnceCache<K, V> {
    pub fn new(ttl: Duration, capacity: NonZeroUsize) -> Self {
        ReadOnceCache {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn put(&self, key: K, value: V) {
        if let Ok(mut entries) = self.entries.lock() {
            // entries are never promoted by reads, so the LRU end holds the oldest puts
            while entries
                .peek_lru()
                .is_some_and(|(_, (stored_at, _))| stored_at.elapsed() >= self.ttl)
            {
                entries.pop_lru();
            }
            entries.put(key, (Instant::now(), value));
        }
    }

    /// Remove and return the entry for `key` if it is still fresh.
    pub fn get_once(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().ok()?;
        let (stored_at, value) = entries.pop(key)?;
        (stored_at.elapsed() < self.ttl).then_some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// PatientSearch decorator that serves an immediate repeat search for the same
/// patient from memory, once.
///
/// Only queries carrying a patient id are cached.
pub struct CachedPatientSearch {
    inner: Arc<dyn PatientSearch>,
    cache: ReadOnceCache<String, Vec<MatchedPatient>>,
}

impl CachedPatientSearch {
    pub fn new(inner: Arc<dyn PatientSearch>, ttl: Duration, capacity: NonZeroUsize) -> Self {
        CachedPatientSearch {
            inner,
            cache: ReadOnceCache::new(ttl, capacity),
        }
    }

    fn cache_key(query: &PatientQuery) -> Option<String> {
        let patient_id = query.patient_id.as_ref()?;
        // scope is part of the key: a backfill search is narrower than an interactive one
        Some(format!("{}|{:?}|{}", patient_id, query.channel_item_ids, query.is_backfill))
    }
}

#[async_trait]
impl PatientSearch for CachedPatientSearch {
    async fn search_patients(&self, query: &PatientQuery) -> Result<Vec<MatchedPatient>, PartnerError> {
        let key = Self::cache_key(query);
        if let Some(key) = &key {
            if let Some(patients) = self.cache.get_once(key) {
                tracing::debug!(patient_id = ?query.patient_id, "Patient search served from read-once cache");
                return Ok(patients);
            }
        }

        let patients = self.inner.search_patients(query).await?;
        if let Some(key) = key {
            self.cache.put(key, patients.clone());
        }
        Ok(patients)
    }
}
