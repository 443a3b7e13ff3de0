//! 統合テスト用の共通基盤
//!
//! インプロセスのテストオリジン（stdスレッド + TcpListener）、プロキシ
//! ハーネス、素のTcpStreamによるHTTPクライアントを提供します。

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use acache::config::{Origin, ProxyConfig};
use acache::proxy::{AlwaysCache, ResponseModifier};
use acache::server;

// ====================
// ポート管理
// ====================

/// 空きポートを確保
pub fn get_available_ports(count: usize) -> Vec<u16> {
    let mut listeners = Vec::with_capacity(count);
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        ports.push(listener.local_addr().expect("local_addr").port());
        listeners.push(listener);
    }
    drop(listeners);
    ports
}

/// ポートが接続可能になるまで待つ
pub fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

// ====================
// テストオリジン
// ====================

/// オリジンが受け取ったリクエスト
pub struct ReceivedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    /// ヘッダー値を取得（大文字小文字を区別しない）
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// オリジンが返すレスポンス
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: &str) -> Self {
        self.body = body.as_bytes().to_vec();
        self
    }
}

pub type Handler = Arc<dyn Fn(&ReceivedRequest) -> TestResponse + Send + Sync>;

/// インプロセスのテストオリジンサーバー
///
/// ハンドラは実行中に差し替え可能。`stop()` でリスナーを閉じると
/// 以降の接続は拒否されます（オリジン停止のシミュレーション）。
pub struct TestOrigin {
    port: u16,
    handler: Arc<Mutex<Handler>>,
    hits: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
}

impl TestOrigin {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&ReceivedRequest) -> TestResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind origin");
        let port = listener.local_addr().expect("local_addr").port();
        listener.set_nonblocking(true).expect("nonblocking");

        let handler: Arc<Mutex<Handler>> = Arc::new(Mutex::new(Arc::new(handler)));
        let hits = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicBool::new(false));

        {
            let handler = handler.clone();
            let hits = hits.clone();
            let stopped = stopped.clone();
            thread::spawn(move || {
                loop {
                    if stopped.load(Ordering::Relaxed) {
                        // リスナーを落として以降の接続を拒否させる
                        drop(listener);
                        return;
                    }
                    match listener.accept() {
                        Ok((stream, _)) => {
                            let handler = handler.lock().unwrap().clone();
                            let hits = hits.clone();
                            thread::spawn(move || {
                                serve_origin_connection(stream, handler, hits);
                            });
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => return,
                    }
                }
            });
        }

        Self {
            port,
            handler,
            hits,
            stopped,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// ハンドラが呼ばれた回数
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// ハンドラを差し替える
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&ReceivedRequest) -> TestResponse + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap() = Arc::new(handler);
    }

    /// オリジンを停止する（以降の接続は拒否）
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
    }
}

impl Drop for TestOrigin {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

fn serve_origin_connection(mut stream: TcpStream, handler: Handler, hits: Arc<AtomicUsize>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    // ヘッダー終端まで読む
    let header_end = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return,
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("/").to_string();

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let content_length: usize = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(_) => return,
        }
    }
    body.truncate(content_length);

    let request = ReceivedRequest {
        method,
        target,
        headers,
        body,
    };
    hits.fetch_add(1, Ordering::SeqCst);
    let response = handler(&request);

    let mut out = Vec::new();
    out.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", response.status, status_text(response.status)).as_bytes(),
    );
    for (name, value) in &response.headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", response.body.len()).as_bytes());
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(&response.body);
    let _ = stream.write_all(&out);
    let _ = stream.flush();
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        303 => "See Other",
        304 => "Not Modified",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "",
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ====================
// プロキシハーネス
// ====================

/// バックグラウンドスレッドで実サーバーを動かすハーネス
pub struct ProxyHarness {
    pub port: u16,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProxyHarness {
    /// アクティブモード（先回りリフレッシュあり）で起動
    pub fn start(origin_port: u16, update_timeout: Duration) -> Self {
        Self::start_with(origin_port, Some(update_timeout), None)
    }

    /// レガシーモード（無効化はパージのみ）で起動
    pub fn start_legacy(origin_port: u16) -> Self {
        Self::start_with(origin_port, None, None)
    }

    /// レスポンス修飾フックを設定して起動
    pub fn start_with_modifier(
        origin_port: u16,
        update_timeout: Duration,
        modifier: ResponseModifier,
    ) -> Self {
        Self::start_with(origin_port, Some(update_timeout), Some(modifier))
    }

    fn start_with(
        origin_port: u16,
        update_timeout: Option<Duration>,
        modifier: Option<ResponseModifier>,
    ) -> Self {
        let port = get_available_ports(1)[0];
        let origin =
            Origin::parse(&format!("http://127.0.0.1:{}", origin_port)).expect("origin url");

        let mut config = ProxyConfig::new(origin);
        config.port = port;
        config.db = "memory".to_string();
        config.update_timeout = update_timeout;
        config.workers = 1;

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                let mut cache = AlwaysCache::new(&config).expect("proxy");
                if let Some(modifier) = modifier {
                    cache = cache.with_response_modifier(modifier);
                }
                server::run_with(Arc::new(cache), &config, shutdown).expect("server");
            })
        };

        assert!(
            wait_for_port(port, Duration::from_secs(5)),
            "proxy did not start"
        );
        Self {
            port,
            shutdown,
            handle: Some(handle),
        }
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ====================
// テストクライアント
// ====================

/// プロキシからの応答
pub struct HttpReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// 任意のリクエストを送信
pub fn http_request(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> HttpReply {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect proxy");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");

    let mut out = Vec::new();
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", method, path).as_bytes());
    out.extend_from_slice(b"Host: localhost\r\n");
    for (name, value) in headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if !body.is_empty() || method == "POST" {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body);
    stream.write_all(&out).expect("write request");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");

    parse_reply(&raw)
}

/// GETリクエストを送信
pub fn http_get(port: u16, path: &str) -> HttpReply {
    http_request(port, "GET", path, &[], b"")
}

fn parse_reply(raw: &[u8]) -> HttpReply {
    let header_end = find_subsequence(raw, b"\r\n\r\n").expect("response head") + 4;
    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let status: u16 = status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    HttpReply {
        status,
        headers,
        body: raw[header_end..].to_vec(),
    }
}
