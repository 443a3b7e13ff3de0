//! インメモリキャッシュストア
//!
//! `RwLock<BTreeMap>` による実装。BTreeMapの順序付きレンジ検索で
//! プレフィックス列挙を行います。読み取りは並行、書き込みは
//! ロックによりグローバルに直列化されます。

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use time::OffsetDateTime;

use super::{CacheEntry, CacheStore, StoreError};
use crate::http::zero_instant;

#[derive(Debug, Clone)]
struct Stored {
    expires: OffsetDateTime,
    requested_at: OffsetDateTime,
    received_at: OffsetDateTime,
    bytes: Vec<u8>,
}

/// インメモリストア
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<BTreeMap<String, Stored>>,
}

impl MemoryCache {
    /// 空のストアを作成
    pub fn new() -> Self {
        Self::default()
    }

    fn with_prefix<T>(
        &self,
        prefix: &str,
        mut f: impl FnMut(&str, &Stored) -> Option<T>,
    ) -> Result<Vec<T>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        let range = entries.range::<str, _>((Bound::Included(prefix), Bound::Unbounded));
        for (key, stored) in range {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(item) = f(key, stored) {
                out.push(item);
            }
        }
        Ok(out)
    }
}

impl CacheStore for MemoryCache {
    fn all(&self, prefix: &str) -> Result<Vec<CacheEntry>, StoreError> {
        self.with_prefix(prefix, |key, stored| {
            Some(CacheEntry {
                key: key.to_string(),
                expires: stored.expires,
                requested_at: stored.requested_at,
                received_at: stored.received_at,
                bytes: stored.bytes.clone(),
            })
        })
    }

    fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        entries.insert(
            entry.key,
            Stored {
                expires: entry.expires,
                requested_at: entry.requested_at,
                received_at: entry.received_at,
                bytes: entry.bytes,
            },
        );
        Ok(())
    }

    fn has(&self, prefix: &str) -> bool {
        self.with_prefix(prefix, |_, _| Some(()))
            .map(|found| !found.is_empty())
            .unwrap_or(false)
    }

    fn oldest(&self, prefix: &str) -> Result<Option<(String, OffsetDateTime)>, StoreError> {
        let candidates = self.with_prefix(prefix, |key, stored| {
            if stored.expires > zero_instant() {
                Some((key.to_string(), stored.expires))
            } else {
                None
            }
        })?;
        Ok(candidates
            .into_iter()
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0))))
    }

    fn all_keys(&self, prefix: &str, cb: &mut dyn FnMut(&str)) {
        if let Ok(keys) = self.with_prefix(prefix, |key, _| Some(key.to_string())) {
            for key in keys {
                cb(&key);
            }
        }
    }

    fn purge(&self, key: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{entry, exercise_store};

    #[test]
    fn test_memory_store_contract() {
        let store = MemoryCache::new();
        exercise_store(&store);
    }

    #[test]
    fn test_oldest_tie_break_is_stable() {
        let store = MemoryCache::new();
        let mut a = entry("o:GET:/a\t", 60);
        let mut b = entry("o:GET:/b\t", 60);
        b.expires = a.expires;
        store.put(b.clone()).unwrap();
        store.put(a.clone()).unwrap();
        // 同一expiresではキーの辞書順で安定
        let (key, _) = store.oldest("o:").unwrap().unwrap();
        assert_eq!(key, "o:GET:/a\t");
        let (key2, _) = store.oldest("o:").unwrap().unwrap();
        assert_eq!(key, key2);
    }

    #[test]
    fn test_concurrent_readers() {
        use std::sync::Arc;
        let store = Arc::new(MemoryCache::new());
        store.put(entry("o:GET:/\t", 60)).unwrap();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    assert_eq!(store.all("o:").unwrap().len(), 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
