//! リフレッシュスケジューラ
//!
//! オリジンごとに1本の常駐タスクが、最も早く期限切れになるGETエントリを
//! 監視し、地平線（update_timeout）内に期限が来るものを先回りで再取得
//! します。これにより安定したリソースのクライアント視点ヒット率は
//! 100%に近づきます。失敗したエントリは1秒後に1回だけ再試行し、
//! それでも失敗すればパージします。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ftlog::{error, info, trace};
use time::OffsetDateTime;

use crate::keyer::KeyError;
use crate::proxy::AlwaysCache;

/// リトライまでの待ち時間
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// シャットダウンに応答できる粒度
const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

impl AlwaysCache {
    /// リフレッシュループ本体
    ///
    /// レガシーモード（update_timeoutなし）では何もせずに戻ります。
    /// シャットダウンフラグの監視により安全に停止できます。
    pub async fn update_loop(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        let Some(update_timeout) = self.update_timeout else {
            return;
        };
        let horizon = time::Duration::try_from(update_timeout)
            .unwrap_or_else(|_| time::Duration::seconds(15));
        info!(
            "Starting cache update loop with timeout {:?}",
            update_timeout
        );

        let get_prefix = self.keyer.method_prefix("GET");
        while !shutdown.load(Ordering::Relaxed) {
            match self.store.oldest(&get_prefix) {
                Err(e) => {
                    error!("Could not get oldest entry: {}", e);
                    sleep_checking(update_timeout, &shutdown).await;
                }
                Ok(Some((key, expires)))
                    if expires - OffsetDateTime::now_utc() <= horizon =>
                {
                    self.update_entry(&key).await;
                }
                Ok(_) => {
                    trace!("No entries expiring, pausing update");
                    sleep_checking(update_timeout, &shutdown).await;
                }
            }
        }
        info!("Cache update loop stopped");
    }

    /// オリジンの全エントリを順にリフレッシュ
    ///
    /// `/.acache-update` エンドポイントから非同期に起動されます。
    pub async fn update_all(self: Arc<Self>) {
        let mut keys = Vec::new();
        self.store
            .all_keys(self.keyer.origin_prefix(), &mut |key| {
                keys.push(key.to_string())
            });
        info!("Updating all {} stored entries", keys.len());
        for key in keys {
            self.update_entry(&key).await;
        }
    }

    /// 1エントリをリフレッシュ
    ///
    /// キーからGETリクエストを再構築してオリジンに再発行し、結果で
    /// 置き換えます。GET以外のキーは静かにパージします（安全に再実行
    /// できないため）。保存不可・失敗時もパージします。
    pub(crate) async fn update_entry(&self, key: &str) {
        // ループとオンデマンド更新の二重リフレッシュを合流させる
        if !self.inflight.insert(key.to_string()) {
            return;
        }

        match self.keyer.request_from_key(key) {
            Err(KeyError::MethodNotSupported) => {
                self.store.purge(key);
            }
            Err(e) => {
                error!("Could not get request from key: {}", e);
                self.store.purge(key);
            }
            Ok(req) => {
                trace!("Updating cache for key {}", key);
                let (mut cached, _) = self.save_request(&req).await;
                if !cached {
                    monoio::time::sleep(RETRY_DELAY).await;
                    let (retried, _) = self.save_request(&req).await;
                    cached = retried;
                }
                if !cached {
                    self.store.purge(key);
                }
            }
        }

        self.inflight.remove(key);
    }
}

/// シャットダウンフラグを見ながら待機
async fn sleep_checking(total: Duration, shutdown: &AtomicBool) {
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let step = remaining.min(SHUTDOWN_POLL);
        monoio::time::sleep(step).await;
        remaining -= step;
    }
}
