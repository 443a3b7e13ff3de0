//! acache 実行バイナリ
//!
//! CLIフラグから設定を組み立て、ロガーとシグナルハンドラを初期化して
//! プロキシサーバーを起動します。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use ftlog::appender::FileAppender;
use ftlog::info;
use mimalloc::MiMalloc;
use rustls::crypto::CryptoProvider;

use acache::config::{Origin, ProxyConfig, DEFAULT_UPDATE_TIMEOUT};
use acache::rules::Rules;
use acache::server;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// RFC 9111準拠の共有キャッシュリバースプロキシ
#[derive(Debug, Parser)]
#[command(name = "acache", version, about)]
struct Cli {
    /// オリジンURL（addr / hostより優先）
    #[arg(long)]
    origin: Option<String>,

    /// オリジンのIPアドレス（TLS接続、SNIはhostで指定）
    #[arg(long)]
    addr: Option<String>,

    /// オリジンのホスト名（addrと併用）
    #[arg(long, default_value = "")]
    host: String,

    /// リッスンポート
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// キャッシュDB（LMDB環境のパス、または 'memory'）
    #[arg(long, default_value = "cache.db")]
    db: String,

    /// レスポンス書き換えルールファイル（YAML）
    #[arg(long)]
    rules: Option<PathBuf>,

    /// レガシーモード: 能動リフレッシュせず、必要時の無効化のみ
    #[arg(long)]
    legacy: bool,

    /// トレースログを有効化
    #[arg(long = "vv")]
    verbose: bool,

    /// ログファイル（標準エラー出力に追加）
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        ftlog::LevelFilter::Trace
    } else {
        ftlog::LevelFilter::Debug
    };
    let mut builder = ftlog::Builder::new().max_log_level(level);
    if let Some(path) = &cli.log_file {
        builder = builder.root(FileAppender::new(path));
    }
    let _guard = builder.try_init().expect("Failed to init logger");

    // rustls 0.23+: プロセスレベルで暗号プロバイダーをインストール（ring使用）
    CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .expect("Failed to install rustls crypto provider");

    let origin = if let Some(url) = &cli.origin {
        Origin::parse(url)
    } else if let Some(addr) = &cli.addr {
        Origin::with_host_override(addr, &cli.host)
    } else {
        eprintln!("Please specify origin (--origin or --addr)");
        std::process::exit(1);
    };
    let Some(origin) = origin else {
        eprintln!("Could not parse origin URL");
        std::process::exit(1);
    };

    let mut config = ProxyConfig::new(origin);
    config.port = cli.port;
    config.db = cli.db;
    config.update_timeout = if cli.legacy {
        None
    } else {
        Some(DEFAULT_UPDATE_TIMEOUT)
    };
    if let Some(path) = &cli.rules {
        match Rules::load(path) {
            Ok(rules) => config.rules = rules,
            Err(e) => {
                eprintln!("Cannot load rules from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Received shutdown signal, initiating graceful shutdown...");
            shutdown.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set signal handler");
    }

    info!(
        "Proxying port {} to {} (workers: {})",
        config.port,
        config.origin.id(),
        config.workers
    );

    if let Err(e) = server::run(config, shutdown) {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
