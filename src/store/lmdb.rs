//! LMDB永続化ストア
//!
//! heed（LMDBバインディング）による永続バックエンド。単一の無名データ
//! ベースにキー文字列のバイト列で格納します。LMDBのトランザクションが
//! 書き込みの直列化と読み取りの並行性を提供します。
//!
//! 値のレイアウト: 先頭24バイトにexpires / requested_at / received_at
//! （Unix秒、ビッグエンディアンi64）、続いてシリアライズ済みブロブ。

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use time::OffsetDateTime;

use super::{CacheEntry, CacheStore, StoreError};
use crate::http::zero_instant;

/// ヘッダー部のバイト数（i64 × 3）
const VALUE_HEADER_LEN: usize = 24;

/// デフォルトのマップサイズ（1 GiB）
const MAP_SIZE: usize = 1024 * 1024 * 1024;

/// LMDBストア
pub struct LmdbCache {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbCache {
    /// 環境を開く（ディレクトリは無ければ作成）
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&path).map_err(|e| StoreError::Open(e.to_string()))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| StoreError::Open(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| StoreError::Open(e.to_string()))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| StoreError::Open(e.to_string()))?;
        wtxn.commit().map_err(|e| StoreError::Open(e.to_string()))?;

        Ok(Self { env, db })
    }

    fn encode_value(entry: &CacheEntry) -> Vec<u8> {
        let mut value = Vec::with_capacity(VALUE_HEADER_LEN + entry.bytes.len());
        value.extend_from_slice(&entry.expires.unix_timestamp().to_be_bytes());
        value.extend_from_slice(&entry.requested_at.unix_timestamp().to_be_bytes());
        value.extend_from_slice(&entry.received_at.unix_timestamp().to_be_bytes());
        value.extend_from_slice(&entry.bytes);
        value
    }

    fn decode_value(key: &[u8], value: &[u8]) -> Option<CacheEntry> {
        if value.len() < VALUE_HEADER_LEN {
            return None;
        }
        let expires = i64::from_be_bytes(value[0..8].try_into().ok()?);
        let requested_at = i64::from_be_bytes(value[8..16].try_into().ok()?);
        let received_at = i64::from_be_bytes(value[16..24].try_into().ok()?);
        Some(CacheEntry {
            key: String::from_utf8(key.to_vec()).ok()?,
            expires: OffsetDateTime::from_unix_timestamp(expires).ok()?,
            requested_at: OffsetDateTime::from_unix_timestamp(requested_at).ok()?,
            received_at: OffsetDateTime::from_unix_timestamp(received_at).ok()?,
            bytes: value[VALUE_HEADER_LEN..].to_vec(),
        })
    }

    fn scan<T>(
        &self,
        prefix: &str,
        mut f: impl FnMut(&[u8], &[u8]) -> Option<T>,
    ) -> Result<Vec<T>, StoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let prefix = prefix.as_bytes();
        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            if key.len() >= prefix.len() && &key[..prefix.len()] == prefix {
                if let Some(v) = f(key, value) {
                    out.push(v);
                }
            }
        }
        Ok(out)
    }
}

impl CacheStore for LmdbCache {
    fn all(&self, prefix: &str) -> Result<Vec<CacheEntry>, StoreError> {
        self.scan(prefix, Self::decode_value)
    }

    fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let value = Self::encode_value(&entry);
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.db
            .put(&mut wtxn, entry.key.as_bytes(), &value)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn has(&self, prefix: &str) -> bool {
        self.scan(prefix, |_, _| Some(()))
            .map(|found| !found.is_empty())
            .unwrap_or(false)
    }

    fn oldest(&self, prefix: &str) -> Result<Option<(String, OffsetDateTime)>, StoreError> {
        let zero = zero_instant();
        let candidates = self.scan(prefix, |key, value| {
            let entry = Self::decode_value(key, value)?;
            if entry.expires > zero {
                Some((entry.key, entry.expires))
            } else {
                None
            }
        })?;
        Ok(candidates
            .into_iter()
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0))))
    }

    fn all_keys(&self, prefix: &str, cb: &mut dyn FnMut(&str)) {
        if let Ok(keys) = self.scan(prefix, |key, _| String::from_utf8(key.to_vec()).ok()) {
            for key in keys {
                cb(&key);
            }
        }
    }

    fn purge(&self, key: &str) {
        let result = self.env.write_txn().and_then(|mut wtxn| {
            self.db.delete(&mut wtxn, key.as_bytes())?;
            wtxn.commit()
        });
        if let Err(e) = result {
            ftlog::warn!("Could not purge key from LMDB store: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{entry, exercise_store};

    #[test]
    fn test_lmdb_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbCache::open(dir.path()).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn test_lmdb_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LmdbCache::open(dir.path()).unwrap();
            store.put(entry("o:GET:/persist\t", 60)).unwrap();
        }
        let store = LmdbCache::open(dir.path()).unwrap();
        let all = store.all("o:GET:/persist\t").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].bytes, b"blob:o:GET:/persist\t");
    }

    #[test]
    fn test_timestamps_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbCache::open(dir.path()).unwrap();
        let e = entry("o:GET:/t\t", 120);
        store.put(e.clone()).unwrap();
        let got = store.all("o:GET:/t\t").unwrap().remove(0);
        assert_eq!(got.expires.unix_timestamp(), e.expires.unix_timestamp());
        assert_eq!(
            got.requested_at.unix_timestamp(),
            e.requested_at.unix_timestamp()
        );
        assert_eq!(
            got.received_at.unix_timestamp(),
            e.received_at.unix_timestamp()
        );
    }
}
