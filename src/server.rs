//! サーバーブートストラップ
//!
//! ワーカースレッドごとにランタイムとSO_REUSEPORTリスナーを立ち上げ、
//! 接続ごとにタスクを生成します。リフレッシュループは先頭ワーカーで
//! 1本だけ起動します（オリジンあたり1本）。acceptは1秒タイムアウトで
//! シャットダウンフラグを確認するため、安全に停止できます。

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ftlog::{error, info};
use monoio::net::TcpListener;
use monoio::time::timeout;

use crate::config::ProxyConfig;
use crate::proxy::AlwaysCache;

/// プロキシを起動し、シャットダウンフラグが立つまでブロックする
pub fn run(config: ProxyConfig, shutdown: Arc<AtomicBool>) -> io::Result<()> {
    let cache = AlwaysCache::new(&config)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    run_with(Arc::new(cache), &config, shutdown)
}

/// 構築済みのプロキシでサーバーを起動する
///
/// テストや組み込みでは修飾フックを設定した `AlwaysCache` を渡せます。
pub fn run_with(
    cache: Arc<AlwaysCache>,
    config: &ProxyConfig,
    shutdown: Arc<AtomicBool>,
) -> io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let workers = config.workers.max(1);

    let mut handles = Vec::with_capacity(workers);
    for thread_id in 0..workers {
        let cache = cache.clone();
        let shutdown = shutdown.clone();

        let handle = thread::spawn(move || {
            let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                .enable_timer()
                .build()
                .expect("Failed to create runtime");
            rt.block_on(async move {
                let listener = match create_listener(addr) {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!("[Thread {}] Bind error: {}", thread_id, e);
                        return;
                    }
                };

                // リフレッシュループはオリジンあたり1本
                if thread_id == 0 {
                    let cache = cache.clone();
                    let shutdown = shutdown.clone();
                    monoio::spawn(async move {
                        cache.update_loop(shutdown).await;
                    });
                }

                info!("[Thread {}] Worker started", thread_id);

                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        info!("[Thread {}] Shutting down...", thread_id);
                        break;
                    }

                    // タイムアウト付きaccept（シャットダウン確認のため）
                    let accept_result =
                        timeout(Duration::from_secs(1), listener.accept()).await;
                    let (stream, _peer_addr) = match accept_result {
                        Ok(Ok(conn)) => conn,
                        Ok(Err(e)) => {
                            error!("[Thread {}] Accept error: {}", thread_id, e);
                            continue;
                        }
                        Err(_) => continue,
                    };

                    let _ = stream.set_nodelay(true);
                    let cache = cache.clone();
                    monoio::spawn(async move {
                        cache.serve_connection(stream).await;
                    });
                }

                info!("[Thread {}] Worker stopped", thread_id);
            });
        });
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }
    info!("Server shutdown complete");
    Ok(())
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let config = monoio::net::ListenerConfig::default()
        .reuse_port(true)
        .backlog(8192);
    TcpListener::bind_with_config(addr, &config)
}
