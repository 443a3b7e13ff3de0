//! キャッシュストレージプロバイダ
//!
//! フルキャッシュキーをアドレスとするスレッドセーフなストアの契約と、
//! インメモリ実装・LMDB永続化実装を提供します。リクエストハンドラと
//! リフレッシュループが共有する唯一の可変状態です。
//!
//! 契約:
//! - 同一キーに対する各操作は直列化可能であること
//! - 書き込みはグローバルに直列化され、読み取りは並行に実行できること
//! - プレフィックス検索（バリアント列挙）と最小expires検索ができること

mod lmdb;
mod memory;

use std::sync::Arc;

use time::OffsetDateTime;

pub use lmdb::LmdbCache;
pub use memory::MemoryCache;

/// ストレージ操作のエラー
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// バックエンドの障害
    #[error("cache store backend error: {0}")]
    Backend(String),
    /// 環境の初期化失敗
    #[error("cache store open error: {0}")]
    Open(String),
}

/// 保存された1レスポンス
///
/// `bytes` は元リクエストとレスポンスを復元できるシリアライズ済み
/// ブロブ（serializerモジュール参照）。`expires` がゼロ時刻のエントリは
/// 書き込まれません。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub expires: OffsetDateTime,
    pub requested_at: OffsetDateTime,
    pub received_at: OffsetDateTime,
    pub bytes: Vec<u8>,
}

/// キャッシュストアの契約
///
/// 実装はスレッドセーフであること。オリジンごとのプレフィックスで
/// 操作できることが、単一ストアでの複数オリジン同居の前提となります。
pub trait CacheStore: Send + Sync {
    /// プレフィックスに一致するすべてのエントリを返す
    ///
    /// 1つの（メソッド, URI）のバリアント列挙に使用します。順序は不定。
    fn all(&self, prefix: &str) -> Result<Vec<CacheEntry>, StoreError>;

    /// キーでupsert
    fn put(&self, entry: CacheEntry) -> Result<(), StoreError>;

    /// プレフィックスに一致するエントリが存在するか
    fn has(&self, prefix: &str) -> bool;

    /// プレフィックス内で最小のexpiresを持つエントリを返す
    ///
    /// expiresがゼロ時刻のエントリは対象外。リフレッシュループを駆動します。
    fn oldest(&self, prefix: &str) -> Result<Option<(String, OffsetDateTime)>, StoreError>;

    /// プレフィックスに一致するキーをコールバックで列挙
    ///
    /// 一括リフレッシュのための列挙。巨大なキー集合でも処理できるよう
    /// コールバック形式にしています。
    fn all_keys(&self, prefix: &str, cb: &mut dyn FnMut(&str));

    /// キー完全一致で削除
    fn purge(&self, key: &str);
}

/// `--db` 引数からストアを開く
///
/// `memory` でインメモリ、それ以外はパスをLMDB環境として扱います。
pub fn open_store(db: &str) -> Result<Arc<dyn CacheStore>, StoreError> {
    if db == "memory" {
        Ok(Arc::new(MemoryCache::new()))
    } else {
        Ok(Arc::new(LmdbCache::open(db)?))
    }
}
