//! HTTPメッセージ型
//!
//! 所有権を持つリクエスト/レスポンス表現と、HTTP/1.1ワイヤ形式との
//! 相互変換を提供します。ヘッダー部のパースにはhttparseを使用します。

use super::header::HeaderMap;

/// ヘッダー格納数の上限（httparse用）
const MAX_HEADERS: usize = 64;

/// ワイヤ形式のパースエラー
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    /// ヘッダー部が完結していない
    #[error("incomplete message head")]
    Incomplete,
    /// ヘッダー部が不正
    #[error("malformed message head")]
    Malformed,
}

/// HTTPリクエスト
///
/// `target` はorigin-form（パス+クエリ）のリクエストターゲットです。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Request {
    /// メソッドとターゲットからボディなしのリクエストを作成
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// クエリを除いたパス部分
    pub fn path(&self) -> &str {
        match self.target.find('?') {
            Some(i) => &self.target[..i],
            None => &self.target,
        }
    }

    /// クエリ文字列（`?`は含まない）
    pub fn query(&self) -> Option<&str> {
        self.target.find('?').map(|i| &self.target[i + 1..])
    }

    /// ワイヤ形式からパース
    ///
    /// ボディはContent-Lengthに従って切り出し、なければ残り全部を使用します。
    pub fn from_wire(bytes: &[u8]) -> Result<Self, WireError> {
        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut storage);
        let header_len = match parsed.parse(bytes) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Err(WireError::Incomplete),
            Err(_) => return Err(WireError::Malformed),
        };
        let method = parsed.method.ok_or(WireError::Malformed)?.to_string();
        let target = parsed.path.ok_or(WireError::Malformed)?.to_string();
        let mut headers = HeaderMap::with_capacity(parsed.headers.len());
        for h in parsed.headers.iter() {
            let value = std::str::from_utf8(h.value).map_err(|_| WireError::Malformed)?;
            headers.append(h.name, value);
        }
        let rest = &bytes[header_len..];
        let body = match content_length(&headers) {
            Some(n) if n <= rest.len() => rest[..n].to_vec(),
            _ => rest.to_vec(),
        };
        Ok(Self {
            method,
            target,
            headers,
            body,
        })
    }

    /// HTTP/1.1ワイヤ形式に変換
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256 + self.body.len());
        buf.extend_from_slice(self.method.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.target.as_bytes());
        buf.extend_from_slice(b" HTTP/1.1\r\n");
        self.headers.write_wire(&mut buf);
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// HTTPレスポンス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    /// ステータスコードからボディなしのレスポンスを作成
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// ワイヤ形式からパース
    pub fn from_wire(bytes: &[u8]) -> Result<Self, WireError> {
        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut storage);
        let header_len = match parsed.parse(bytes) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Err(WireError::Incomplete),
            Err(_) => return Err(WireError::Malformed),
        };
        let status = parsed.code.ok_or(WireError::Malformed)?;
        let mut headers = HeaderMap::with_capacity(parsed.headers.len());
        for h in parsed.headers.iter() {
            let value = std::str::from_utf8(h.value).map_err(|_| WireError::Malformed)?;
            headers.append(h.name, value);
        }
        let rest = &bytes[header_len..];
        let body = match content_length(&headers) {
            Some(n) if n <= rest.len() => rest[..n].to_vec(),
            _ => rest.to_vec(),
        };
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    /// HTTP/1.1ワイヤ形式に変換（ヘッダーは保持内容をそのまま出力）
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256 + self.body.len());
        buf.extend_from_slice(b"HTTP/1.1 ");
        let mut num = itoa::Buffer::new();
        buf.extend_from_slice(num.format(self.status).as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(status_text(self.status).as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.headers.write_wire(&mut buf);
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Content-Lengthヘッダーを取得
pub fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get("content-length")
        .and_then(|v| v.trim().parse().ok())
}

/// Transfer-Encodingにchunkedが含まれるか
pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .list_values("transfer-encoding")
        .iter()
        .any(|v| v.eq_ignore_ascii_case("chunked"))
}

/// ステータスコードのReason Phrase
pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Request Entity Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let mut req = Request::new("GET", "/api/items?page=2");
        req.headers.append("Host", "example.com");
        req.headers.append("Accept-Encoding", "gzip");
        let wire = req.to_wire();
        let parsed = Request::from_wire(&wire).unwrap();
        assert_eq!(parsed, req);
        assert_eq!(parsed.path(), "/api/items");
        assert_eq!(parsed.query(), Some("page=2"));
    }

    #[test]
    fn test_request_with_body() {
        let mut req = Request::new("POST", "/submit");
        req.headers.append("Content-Length", "5");
        req.body = b"hello".to_vec();
        let wire = req.to_wire();
        let parsed = Request::from_wire(&wire).unwrap();
        assert_eq!(parsed.body, b"hello");
    }

    #[test]
    fn test_response_roundtrip() {
        let mut res = Response::new(200);
        res.headers.append("Content-Type", "text/plain");
        res.headers.append("Content-Length", "11");
        res.body = b"Hello world".to_vec();
        let wire = res.to_wire();
        let parsed = Response::from_wire(&wire).unwrap();
        assert_eq!(parsed, res);
    }

    #[test]
    fn test_incomplete_head() {
        assert_eq!(
            Response::from_wire(b"HTTP/1.1 200 OK\r\nConte"),
            Err(WireError::Incomplete)
        );
    }

    #[test]
    fn test_malformed_head() {
        assert!(Response::from_wire(b"garbage\r\n\r\n").is_err());
    }

    #[test]
    fn test_chunked_detection() {
        let mut h = HeaderMap::new();
        h.append("Transfer-Encoding", "gzip, chunked");
        assert!(is_chunked(&h));
        let mut h2 = HeaderMap::new();
        h2.append("Transfer-Encoding", "gzip");
        assert!(!is_chunked(&h2));
    }
}
