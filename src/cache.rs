use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, TallyError};
use crate::models::TaxRecord;
use crate::store::TaxRecordStore;

pub const TAX_NAMESPACE: &str = "tax";

/// Key-value cache addressed by (namespace, key). Payloads are stored as JSON
/// so any serde type can go in and come back out.
#[derive(Default)]
pub struct Cache {
    entries: DashMap<(String, String), Value>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        let value = self
            .entries
            .get(&(namespace.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                tracing::warn!(namespace, key, error = %e, "cached payload has the wrong shape");
                None
            }
        }
    }

    pub fn put<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.entries
            .insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// User names match case-insensitively in the store, so they do here too.
fn record_key(user_name: &str) -> String {
    user_name.trim().to_lowercase()
}

/// Cache-aside access to tax records: reads try the cache first, writes go to
/// the store and then overwrite the cache entry.
pub struct CachedTaxRecords {
    store: Arc<dyn TaxRecordStore>,
    cache: Arc<Cache>,
}

impl CachedTaxRecords {
    pub fn new(store: Arc<dyn TaxRecordStore>, cache: Arc<Cache>) -> Self {
        Self { store, cache }
    }

    pub fn get(&self, user_name: &str) -> Result<Option<TaxRecord>> {
        let key = record_key(user_name);
        if let Some(hit) = self.cache.get::<TaxRecord>(TAX_NAMESPACE, &key) {
            tracing::debug!(user = user_name, "cache hit");
            return Ok(Some(hit));
        }
        match self.store.find_tax_record(user_name)? {
            Some(record) => {
                tracing::debug!(user = user_name, "loaded from store, caching");
                self.cache.put(TAX_NAMESPACE, &key, &record)?;
                Ok(Some(record))
            }
            None => {
                tracing::info!(user = user_name, "no tax record in cache or store");
                Ok(None)
            }
        }
    }

    pub fn put(&self, record: &TaxRecord) -> Result<TaxRecord> {
        if record.user_name.trim().is_empty() {
            return Err(TallyError::blank_user_name());
        }
        let saved = self.store.save_tax_record(record)?;
        self.cache.put(TAX_NAMESPACE, &record_key(&saved.user_name), &saved)?;
        tracing::debug!(
            user = %saved.user_name,
            id = ?saved.id,
            cached = self.cache.len(),
            "tax record persisted and cached"
        );
        Ok(saved)
    }

    pub fn all(&self) -> Result<Vec<TaxRecord>> {
        self.store.all_tax_records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Store fake that counts lookups and upserts by case-insensitive name,
    /// keeping the first spelling.
    #[derive(Default)]
    struct CountingStore {
        records: Mutex<Vec<TaxRecord>>,
        lookups: AtomicUsize,
    }

    impl TaxRecordStore for CountingStore {
        fn save_tax_record(&self, record: &TaxRecord) -> Result<TaxRecord> {
            let mut records = self.records.lock().unwrap();
            if let Some(existing) = records
                .iter_mut()
                .find(|r| r.user_name.eq_ignore_ascii_case(&record.user_name))
            {
                *existing = TaxRecord {
                    id: existing.id,
                    user_name: existing.user_name.clone(),
                    ..record.clone()
                };
                return Ok(existing.clone());
            }
            let saved = TaxRecord {
                id: Some(records.len() as i64 + 1),
                ..record.clone()
            };
            records.push(saved.clone());
            Ok(saved)
        }

        fn find_tax_record(&self, user_name: &str) -> Result<Option<TaxRecord>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.user_name.eq_ignore_ascii_case(user_name))
                .cloned())
        }

        fn all_tax_records(&self) -> Result<Vec<TaxRecord>> {
            Ok(self.records.lock().unwrap().clone())
        }
    }

    fn cached() -> (Arc<CountingStore>, Arc<Cache>, CachedTaxRecords) {
        let store = Arc::new(CountingStore::default());
        let cache = Arc::new(Cache::new());
        let records = CachedTaxRecords::new(store.clone(), cache.clone());
        (store, cache, records)
    }

    #[test]
    fn test_get_after_put_skips_store() {
        let (store, _cache, records) = cached();
        let saved = records.put(&TaxRecord::assess("alice", 600_000.0)).unwrap();
        let got = records.get("alice").unwrap().unwrap();
        assert_eq!(got, saved);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_miss_populates_cache_once() {
        let (store, cache, records) = cached();
        store.save_tax_record(&TaxRecord::assess("bob", 10.0)).unwrap();

        assert!(records.get("bob").unwrap().is_some());
        assert!(records.get("bob").unwrap().is_some());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lookup_ignores_name_case() {
        let (store, cache, records) = cached();
        records.put(&TaxRecord::assess("alice", 100.0)).unwrap();
        records.put(&TaxRecord::assess("ALICE", 1_500_000.0)).unwrap();

        let got = records.get("alice").unwrap().unwrap();
        assert_eq!(got.income, 1_500_000.0);
        assert_eq!(got.user_name, "alice");
        assert_eq!(records.get(" Alice ").unwrap().unwrap(), got);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lookup_ignores_name_case_against_sqlite() {
        let (_dir, store) = crate::db::tests::test_store();
        let records = CachedTaxRecords::new(Arc::new(store), Arc::new(Cache::new()));
        records.put(&TaxRecord::assess("alice", 100.0)).unwrap();
        records.put(&TaxRecord::assess("ALICE", 1_500_000.0)).unwrap();
        let got = records.get("alice").unwrap().unwrap();
        assert_eq!(got.income, 1_500_000.0);
        assert_eq!(got.tax_amount, 262_500.0);
    }

    #[test]
    fn test_unknown_user_is_not_cached() {
        let (store, cache, records) = cached();
        assert!(records.get("ghost").unwrap().is_none());
        assert!(records.get("ghost").unwrap().is_none());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_put_overwrites_entry() {
        let (_store, cache, records) = cached();
        records.put(&TaxRecord::assess("carol", 100.0)).unwrap();
        records.put(&TaxRecord::assess("carol", 2_000_000.0)).unwrap();
        let got = records.get("carol").unwrap().unwrap();
        assert_eq!(got.income, 2_000_000.0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_rejects_blank_user() {
        let (_store, cache, records) = cached();
        let err = records.put(&TaxRecord::assess("  ", 1.0)).unwrap_err();
        assert!(matches!(err, TallyError::Business { code: "1001", .. }));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_typed_get_with_wrong_type_is_a_miss() {
        let cache = Cache::new();
        cache.put("ns", "k", &"just a string").unwrap();
        assert!(cache.get::<TaxRecord>("ns", "k").is_none());
        assert_eq!(cache.get::<String>("ns", "k").as_deref(), Some("just a string"));
    }
}
