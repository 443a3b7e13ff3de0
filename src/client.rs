//! オリジントランスポート
//!
//! オリジンへのHTTP/1.1リクエスト送信とレスポンス受信を行います。
//! リダイレクトは追跡しません。スレッドローカルなコネクションプールで
//! Keep-Alive接続を再利用し、HTTP用とHTTPS用を別々に管理します。
//! TLSのサーバー名とHostヘッダーは設定されたホスト名を使うため、
//! 接続先はIPアドレスでも構いません。

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use ftlog::warn;
use monoio::net::TcpStream;
use monoio::time::timeout;
use monoio_rustls::{ClientTlsStream, TlsConnector};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};

use crate::config::Origin;
use crate::http::{
    is_chunked, is_valid_header_name, is_valid_header_value, strip_hop_by_hop, ChunkedDecoder,
    HeaderMap, Request, Response,
};
use crate::stream::{AsyncReader, AsyncWriter};

/// 読み書きバッファサイズ
const BUF_SIZE: usize = 65536;

/// レスポンスヘッダー部の上限
const MAX_RESPONSE_HEADER_SIZE: usize = 65536;

/// タイムアウト設定
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// プール設定
const POOL_MAX_IDLE_PER_HOST: usize = 8;
const POOL_IDLE_TIMEOUT_SECS: u64 = 30;

// ====================
// コネクションプール
// ====================

struct PooledConnection<T> {
    stream: T,
    created_at: std::time::Instant,
}

impl<T> PooledConnection<T> {
    fn new(stream: T) -> Self {
        Self {
            stream,
            created_at: std::time::Instant::now(),
        }
    }

    fn is_valid(&self) -> bool {
        self.created_at.elapsed().as_secs() < POOL_IDLE_TIMEOUT_SECS
    }
}

struct ConnectionPool<T> {
    connections: HashMap<String, VecDeque<PooledConnection<T>>>,
}

impl<T> ConnectionPool<T> {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<T> {
        if let Some(queue) = self.connections.get_mut(key) {
            while let Some(entry) = queue.pop_front() {
                if entry.is_valid() {
                    return Some(entry.stream);
                }
                // 無効な接続は破棄
            }
        }
        None
    }

    fn put(&mut self, key: String, stream: T) {
        let queue = self.connections.entry(key).or_insert_with(VecDeque::new);
        while queue.len() >= POOL_MAX_IDLE_PER_HOST {
            queue.pop_front();
        }
        queue.push_back(PooledConnection::new(stream));
    }
}

thread_local! {
    static HTTP_POOL: RefCell<ConnectionPool<TcpStream>> = RefCell::new(ConnectionPool::new());
    static HTTPS_POOL: RefCell<ConnectionPool<ClientTlsStream<TcpStream>>> =
        RefCell::new(ConnectionPool::new());

    static TLS_CONNECTOR: TlsConnector = {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        TlsConnector::from(Arc::new(client_config))
    };
}

// ====================
// リクエスト送信
// ====================

/// オリジンにリクエストを送り、完全なレスポンスを受信する
///
/// レスポンスボディはContent-Length / chunked / EOFの各フレーミングを
/// 解決して完全にバッファします。chunkedはデコードされ、Transfer-Encoding
/// ヘッダーは取り除かれます。
pub async fn fetch(origin: &Origin, req: &Request) -> io::Result<Response> {
    let expect_body = !req.method.eq_ignore_ascii_case("HEAD");
    let wire = build_upstream_wire(origin, req);

    if origin.use_tls {
        fetch_tls(origin, wire, expect_body).await
    } else {
        fetch_plain(origin, wire, expect_body).await
    }
}

async fn fetch_plain(origin: &Origin, wire: Vec<u8>, expect_body: bool) -> io::Result<Response> {
    let pool_key = origin.addr();

    // プール済み接続はアイドル中に切断されている可能性があるため、
    // 失敗したら新規接続で一度だけやり直す
    if let Some(mut stream) = HTTP_POOL.with(|p| p.borrow_mut().get(&pool_key)) {
        if let Ok((res, keep_alive)) = exchange(&mut stream, wire.clone(), expect_body).await {
            if keep_alive {
                HTTP_POOL.with(|p| p.borrow_mut().put(pool_key, stream));
            }
            return Ok(res);
        }
    }

    let mut stream = connect_tcp(&pool_key).await?;
    let (res, keep_alive) = exchange(&mut stream, wire, expect_body).await?;
    if keep_alive {
        HTTP_POOL.with(|p| p.borrow_mut().put(pool_key, stream));
    }
    Ok(res)
}

async fn fetch_tls(origin: &Origin, wire: Vec<u8>, expect_body: bool) -> io::Result<Response> {
    let pool_key = origin.addr();

    if let Some(mut stream) = HTTPS_POOL.with(|p| p.borrow_mut().get(&pool_key)) {
        if let Ok((res, keep_alive)) = exchange(&mut stream, wire.clone(), expect_body).await {
            if keep_alive {
                HTTPS_POOL.with(|p| p.borrow_mut().put(pool_key, stream));
            }
            return Ok(res);
        }
    }

    let tcp = connect_tcp(&pool_key).await?;
    let server_name = ServerName::try_from(origin.host_header.clone())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let connector = TLS_CONNECTOR.with(|c| c.clone());
    let mut stream = timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timeout"))?
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let (res, keep_alive) = exchange(&mut stream, wire, expect_body).await?;
    if keep_alive {
        HTTPS_POOL.with(|p| p.borrow_mut().put(pool_key, stream));
    }
    Ok(res)
}

async fn connect_tcp(addr: &str) -> io::Result<TcpStream> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

// ====================
// ワイヤ形式の構築
// ====================

/// 上流へのリクエストバイト列を構築
///
/// ホップバイホップヘッダーを除去し、Hostと Connection: keep-alive を
/// 設定します。不正なヘッダー名・値（インジェクションの疑い）は除外します。
fn build_upstream_wire(origin: &Origin, req: &Request) -> Vec<u8> {
    let mut headers = req.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove("host");
    headers.remove("content-length");

    let mut wire = Vec::with_capacity(1024 + req.body.len());
    wire.extend_from_slice(req.method.as_bytes());
    wire.push(b' ');
    wire.extend_from_slice(req.target.as_bytes());
    wire.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    wire.extend_from_slice(origin.host_value().as_bytes());
    wire.extend_from_slice(b"\r\n");

    for (name, value) in headers.iter() {
        if !is_valid_header_name(name) {
            warn!("Invalid header name detected, skipping: {:?}", name);
            continue;
        }
        if !is_valid_header_value(value) {
            warn!(
                "Invalid header value detected (possible header injection), skipping header: {:?}",
                name
            );
            continue;
        }
        wire.extend_from_slice(name.as_bytes());
        wire.extend_from_slice(b": ");
        wire.extend_from_slice(value.as_bytes());
        wire.extend_from_slice(b"\r\n");
    }

    if !req.body.is_empty() || req.method == "POST" || req.method == "PUT" {
        wire.extend_from_slice(b"Content-Length: ");
        let mut num = itoa::Buffer::new();
        wire.extend_from_slice(num.format(req.body.len()).as_bytes());
        wire.extend_from_slice(b"\r\n");
    }
    wire.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    wire.extend_from_slice(&req.body);
    wire
}

// ====================
// レスポンス受信
// ====================

/// リクエストを書き込み、レスポンスを完全に読み取る
///
/// 戻り値は `(レスポンス, 接続を再利用できるか)`。
async fn exchange<S>(
    stream: &mut S,
    wire: Vec<u8>,
    expect_body: bool,
) -> io::Result<(Response, bool)>
where
    S: AsyncReader + AsyncWriter,
{
    let (write_result, _buf) = timeout(WRITE_TIMEOUT, stream.write_buf(wire))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timeout"))?;
    write_result?;

    read_response(stream, expect_body).await
}

async fn read_response<S: AsyncReader>(
    stream: &mut S,
    expect_body: bool,
) -> io::Result<(Response, bool)> {
    let mut accumulated: Vec<u8> = Vec::with_capacity(BUF_SIZE);
    let mut eof = false;

    // ヘッダー部が完結するまで読む
    let head = loop {
        if let Some(head) = parse_head(&accumulated)? {
            break head;
        }
        if eof {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            ));
        }
        if accumulated.len() > MAX_RESPONSE_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response header too large",
            ));
        }
        eof = read_some(stream, &mut accumulated).await?;
    };

    let ParsedHead {
        status,
        header_len,
        headers,
        connection_close,
    } = head;

    let mut body = Vec::new();
    let mut keep_alive = !connection_close;

    let has_body = expect_body && status != 204 && status != 304 && (100..=599).contains(&status);
    if has_body {
        if is_chunked(&headers) {
            // chunkedはデコードしてペイロードのみ保持する
            let mut decoder = ChunkedDecoder::new();
            let (mut done, _) = decoder.decode(&accumulated[header_len..], &mut body);
            while !done {
                if eof {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid chunked body",
                    ));
                }
                let mut chunk_in = Vec::new();
                eof = read_some(stream, &mut chunk_in).await?;
                let (d, _) = decoder.decode(&chunk_in, &mut body);
                done = d;
            }
        } else if let Some(length) = crate::http::content_length(&headers) {
            body.extend_from_slice(&accumulated[header_len..]);
            while body.len() < length {
                if eof {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid body",
                    ));
                }
                eof = read_some(stream, &mut body).await?;
            }
            body.truncate(length);
        } else {
            // フレーミング情報なし: EOFまで読む（接続は再利用できない）
            keep_alive = false;
            body.extend_from_slice(&accumulated[header_len..]);
            while !eof {
                eof = read_some(stream, &mut body).await?;
            }
        }
    }

    let mut res = Response {
        status,
        headers,
        body,
    };
    // ボディは再フレーミングされるため転送フレーミングのヘッダーは外す
    res.headers.remove("transfer-encoding");

    Ok((res, keep_alive))
}

struct ParsedHead {
    status: u16,
    header_len: usize,
    headers: HeaderMap,
    connection_close: bool,
}

fn parse_head(data: &[u8]) -> io::Result<Option<ParsedHead>> {
    let mut storage = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut storage);
    match response.parse(data) {
        Ok(httparse::Status::Complete(header_len)) => {
            let status = response.code.unwrap_or(502);
            let mut headers = HeaderMap::with_capacity(response.headers.len());
            for h in response.headers.iter() {
                let value = std::str::from_utf8(h.value).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "non-utf8 header value")
                })?;
                headers.append(h.name, value);
            }
            let connection_close = headers
                .get("connection")
                .map(|v| v.trim().eq_ignore_ascii_case("close"))
                .unwrap_or(false);
            Ok(Some(ParsedHead {
                status,
                header_len,
                headers,
                connection_close,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
    }
}

/// 1回分読み取って追記。EOFに達したらtrueを返す
async fn read_some<S: AsyncReader>(stream: &mut S, out: &mut Vec<u8>) -> io::Result<bool> {
    let buf = vec![0u8; BUF_SIZE];
    let (result, returned) = timeout(READ_TIMEOUT, stream.read_buf(buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))?;
    let n = result?;
    if n == 0 {
        return Ok(true);
    }
    out.extend_from_slice(&returned[..n]);
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_upstream_wire_strips_hop_by_hop() {
        let origin = Origin::parse("http://origin.test:8080").unwrap();
        let mut req = Request::new("GET", "/path?q=1");
        req.headers.append("Host", "proxy.example");
        req.headers.append("Connection", "keep-alive, X-Secret");
        req.headers.append("X-Secret", "1");
        req.headers.append("Proxy-Connection", "keep-alive");
        req.headers.append("TE", "trailers");
        req.headers.append("Accept", "*/*");

        let wire = String::from_utf8(build_upstream_wire(&origin, &req)).unwrap();
        assert!(wire.starts_with("GET /path?q=1 HTTP/1.1\r\nHost: origin.test:8080\r\n"));
        assert!(wire.contains("Accept: */*\r\n"));
        assert!(!wire.contains("X-Secret"));
        assert!(!wire.contains("Proxy-Connection"));
        assert!(!wire.contains("TE:"));
        assert!(wire.contains("Connection: keep-alive\r\n\r\n"));
        // Hostはオリジンのもののみ
        assert!(!wire.contains("proxy.example"));
    }

    #[test]
    fn test_build_upstream_wire_post_body() {
        let origin = Origin::parse("http://origin.test").unwrap();
        let mut req = Request::new("POST", "/submit");
        req.body = b"a=1".to_vec();
        let wire = String::from_utf8(build_upstream_wire(&origin, &req)).unwrap();
        assert!(wire.contains("Content-Length: 3\r\n"));
        assert!(wire.ends_with("\r\n\r\na=1"));
    }

    #[test]
    fn test_build_upstream_wire_rejects_injection() {
        let origin = Origin::parse("http://origin.test").unwrap();
        let mut req = Request::new("GET", "/");
        req.headers.append("X-Evil", "a\r\nInjected: 1");
        let wire = String::from_utf8(build_upstream_wire(&origin, &req)).unwrap();
        assert!(!wire.contains("Injected"));
    }

    #[test]
    fn test_parse_head_connection_close() {
        let head = parse_head(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.status, 200);
        assert!(head.connection_close);
    }

    #[test]
    fn test_parse_head_partial() {
        assert!(parse_head(b"HTTP/1.1 200").unwrap().is_none());
    }
}
