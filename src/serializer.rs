//! 保存エントリのシリアライズ
//!
//! 元リクエストとレスポンスを1つのブロブに格納し、再利用・検証・
//! リフレッシュが元リクエストを復元できるようにします。レイアウト:
//!
//! ```text
//! <リクエストのHTTP/1.1ワイヤ形式>
//! \r\n\r\n----\r\n\r\n
//! <レスポンスのHTTP/1.1ワイヤ形式（時刻ヘッダー2つを付加）>
//! ```
//!
//! ディスク上の時刻ヘッダーはUnix秒で、読み出し時に除去されます。

use time::OffsetDateTime;

use crate::http::{Request, Response};

const DELIMITER: &[u8] = b"\r\n\r\n----\r\n\r\n";

const RESPONSE_TIME_HEADER: &str = "Acache-Response-Time";
const REQUEST_TIME_HEADER: &str = "Acache-Request-Time";

/// シリアライズ/デシリアライズのエラー
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    /// レスポンス部が不正
    #[error("malformed stored response: {0}")]
    MalformedResponse(crate::http::WireError),
    /// 時刻ヘッダーが欠落または不正
    #[error("missing or invalid time header: {0}")]
    InvalidTime(String),
}

/// 保存対象のレスポンスと記録時刻
///
/// `request` は保存を発生させた元リクエスト。古い形式のエントリでは
/// 欠落している場合があります。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedResponse {
    pub response: Response,
    pub request: Option<Request>,
    /// 保存レスポンスを生んだリクエスト発行時点のクロック値
    pub request_time: OffsetDateTime,
    /// レスポンス受信時点のクロック値
    pub response_time: OffsetDateTime,
}

/// ブロブへ変換
pub fn to_bytes(timed: &TimedResponse) -> Vec<u8> {
    let mut buf = Vec::with_capacity(512 + timed.response.body.len());
    if let Some(req) = &timed.request {
        buf.extend_from_slice(&req.to_wire());
    }
    buf.extend_from_slice(DELIMITER);

    let mut res = timed.response.clone();
    res.headers.set(
        RESPONSE_TIME_HEADER,
        timed.response_time.unix_timestamp().to_string(),
    );
    res.headers.set(
        REQUEST_TIME_HEADER,
        timed.request_time.unix_timestamp().to_string(),
    );
    buf.extend_from_slice(&res.to_wire());
    buf
}

/// ブロブから復元
///
/// リクエスト部の欠落（旧形式）は許容しますが、レスポンス部が不正な
/// 場合はエラーを返します。
pub fn from_bytes(bytes: &[u8]) -> Result<TimedResponse, SerializeError> {
    let (request_bytes, response_bytes) = match find_delimiter(bytes) {
        Some(i) => (&bytes[..i], &bytes[i + DELIMITER.len()..]),
        // 区切りがない旧形式はレスポンスのみとみなす
        None => (&bytes[..0], bytes),
    };

    let request = if request_bytes.is_empty() {
        None
    } else {
        match Request::from_wire(request_bytes) {
            Ok(req) => Some(req),
            Err(e) => {
                ftlog::warn!("Could not read request from stored entry: {}", e);
                None
            }
        }
    };

    let mut response =
        Response::from_wire(response_bytes).map_err(SerializeError::MalformedResponse)?;

    let response_time = take_time_header(&mut response, RESPONSE_TIME_HEADER)?;
    let request_time = take_time_header(&mut response, REQUEST_TIME_HEADER)?;

    Ok(TimedResponse {
        response,
        request,
        request_time,
        response_time,
    })
}

fn take_time_header(
    res: &mut Response,
    name: &str,
) -> Result<OffsetDateTime, SerializeError> {
    let value = res
        .headers
        .get(name)
        .ok_or_else(|| SerializeError::InvalidTime(name.to_string()))?
        .to_string();
    res.headers.remove(name);
    let seconds: i64 = value
        .trim()
        .parse()
        .map_err(|_| SerializeError::InvalidTime(format!("{}: {}", name, value)))?;
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|_| SerializeError::InvalidTime(format!("{}: {}", name, value)))
}

fn find_delimiter(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < DELIMITER.len() {
        return None;
    }
    bytes
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TimedResponse {
        let mut req = Request::new("GET", "/data?x=1");
        req.headers.append("Host", "origin.test");
        req.headers.append("Accept-Encoding", "gzip");

        let mut res = Response::new(200);
        res.headers.append("Content-Type", "text/plain");
        res.headers.append("Cache-Control", "max-age=60");
        res.headers.append("Content-Length", "11");
        res.body = b"Hello world".to_vec();

        let now = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap();
        TimedResponse {
            response: res,
            request: Some(req),
            request_time: now - time::Duration::seconds(1),
            response_time: now,
        }
    }

    #[test]
    fn test_roundtrip() {
        let original = sample();
        let bytes = to_bytes(&original);
        let restored = from_bytes(&bytes).unwrap();
        assert_eq!(restored.response, original.response);
        assert_eq!(restored.request, original.request);
        assert_eq!(
            restored.request_time.unix_timestamp(),
            original.request_time.unix_timestamp()
        );
        assert_eq!(
            restored.response_time.unix_timestamp(),
            original.response_time.unix_timestamp()
        );
    }

    #[test]
    fn test_time_headers_not_leaked() {
        let bytes = to_bytes(&sample());
        let restored = from_bytes(&bytes).unwrap();
        assert!(!restored.response.headers.contains(RESPONSE_TIME_HEADER));
        assert!(!restored.response.headers.contains(REQUEST_TIME_HEADER));
    }

    #[test]
    fn test_missing_request_part_tolerated() {
        let mut timed = sample();
        timed.request = None;
        let bytes = to_bytes(&timed);
        let restored = from_bytes(&bytes).unwrap();
        assert!(restored.request.is_none());
        assert_eq!(restored.response, timed.response);
    }

    #[test]
    fn test_malformed_response_fails() {
        let mut bytes = b"GET / HTTP/1.1\r\n\r\n".to_vec();
        bytes.extend_from_slice(DELIMITER);
        bytes.extend_from_slice(b"not an http response");
        assert!(from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_missing_time_headers_fail() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(DELIMITER);
        bytes.extend_from_slice(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        assert!(matches!(
            from_bytes(&bytes),
            Err(SerializeError::InvalidTime(_))
        ));
    }

    #[test]
    fn test_body_with_delimiter_lookalike() {
        // ボディに区切り列が含まれても最初の区切りで分割される
        let mut timed = sample();
        timed.response.body = b"x\r\n\r\n----\r\n\r\ny".to_vec();
        timed
            .response
            .headers
            .set("Content-Length", timed.response.body.len().to_string());
        let bytes = to_bytes(&timed);
        let restored = from_bytes(&bytes).unwrap();
        assert_eq!(restored.response.body, timed.response.body);
    }
}
