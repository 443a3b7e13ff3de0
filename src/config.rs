//! プロキシ設定
//!
//! CLIから組み立てる実行時設定と、オリジンURLのパース結果を保持します。

use std::time::Duration;

use crate::rules::Rules;

/// デフォルトのリフレッシュ走査間隔
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(15);

/// 転送先オリジン
///
/// 接続先アドレスとTLS/Hostに使うホスト名は独立しており、
/// `--addr` + `--host` でIP直結とSNI上書きを両立できます。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// TLSで接続するか
    pub use_tls: bool,
    /// 接続先ホスト（IPでもよい）
    pub host: String,
    /// 接続先ポート
    pub port: u16,
    /// Hostヘッダー・TLSサーバー名に使うホスト名
    pub host_header: String,
}

impl Origin {
    /// オリジンURLをパース
    ///
    /// `http://` / `https://` のみ受理し、ポート省略時は既定ポートを
    /// 使用します。パス部分は無視されます（単一オリジンのプロキシは
    /// ターゲットをそのまま転送する）。
    pub fn parse(url: &str) -> Option<Self> {
        let (use_tls, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else {
            return None;
        };

        let host_port = match rest.find('/') {
            Some(i) => &rest[..i],
            None => rest,
        };
        if host_port.is_empty() {
            return None;
        }

        let (host, port) = match host_port.rfind(':') {
            Some(i) => {
                let p = host_port[i + 1..].parse().ok()?;
                (host_port[..i].to_string(), p)
            }
            None => (host_port.to_string(), if use_tls { 443 } else { 80 }),
        };

        Some(Origin {
            use_tls,
            host_header: host.clone(),
            host,
            port,
        })
    }

    /// IPアドレス直結 + ホスト名上書きのオリジンを作成
    ///
    /// TLSハンドシェイクとHostヘッダーには `host` を使い、TCP接続は
    /// `addr` に対して行います。
    pub fn with_host_override(addr: &str, host: &str) -> Option<Self> {
        let mut origin = Self::parse(&format!("https://{}", addr))?;
        if !host.is_empty() {
            origin.host_header = host.to_string();
        }
        Some(origin)
    }

    /// 既定ポートか
    #[inline]
    pub fn is_default_port(&self) -> bool {
        if self.use_tls {
            self.port == 443
        } else {
            self.port == 80
        }
    }

    /// TCP接続先（host:port）
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Hostヘッダーの値（既定ポート以外はポート付き）
    pub fn host_value(&self) -> String {
        if self.is_default_port() {
            self.host_header.clone()
        } else {
            format!("{}:{}", self.host_header, self.port)
        }
    }

    /// オリジン識別子（キャッシュキーのorigin-id既定値）
    pub fn id(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        if self.is_default_port() {
            format!("{}://{}", scheme, self.host_header)
        } else {
            format!("{}://{}:{}", scheme, self.host_header, self.port)
        }
    }
}

/// プロキシの実行時設定
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// リッスンポート
    pub port: u16,
    /// 転送先オリジン
    pub origin: Origin,
    /// ストレージ指定（`memory` またはLMDB環境のパス）
    pub db: String,
    /// origin-idの明示指定（省略時はオリジンURL）
    pub cache_key: Option<String>,
    /// リフレッシュ走査の地平線。`None` でレガシーモード
    /// （能動リフレッシュなし、無効化はパージのみ）
    pub update_timeout: Option<Duration>,
    /// ワーカースレッド数
    pub workers: usize,
    /// レスポンス書き換えルール
    pub rules: Rules,
}

impl ProxyConfig {
    /// 既定値で作成
    pub fn new(origin: Origin) -> Self {
        Self {
            port: 8080,
            origin,
            db: "memory".to_string(),
            cache_key: None,
            update_timeout: Some(DEFAULT_UPDATE_TIMEOUT),
            workers: num_cpus::get(),
            rules: Rules::default(),
        }
    }
}
