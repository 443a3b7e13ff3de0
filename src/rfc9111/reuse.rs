//! 再利用可否判定（RFC 9111 §4）と条件付きリクエスト構築（§4.3.1）
//!
//! ゲートは仕様の記載順に評価し、最初に失敗したゲートが転送理由になります。
//! 検証付きで再利用できる場合は、現在のクライアントリクエストを起点に
//! 条件付きリクエストを構築して返します（リクエストの破壊的変更はしない）。

use time::OffsetDateTime;

use super::cache_control::CacheControl;
use super::freshness::{current_age, is_fresh};
use crate::http::{to_delta_seconds, Request, Response};
use crate::rfc9211::FwdReason;

/// 再利用判定の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reusability {
    /// そのまま再利用してよい
    Reuse,
    /// 検証に成功すれば再利用できる（304が返れば再利用）
    Validate {
        request: Request,
        reason: FwdReason,
    },
    /// このエントリでは満たせない（次のバリアントへ、または転送）
    Forward(FwdReason),
}

/// 安全なメソッドか（GET / HEAD）
#[inline]
pub fn is_safe_method(method: &str) -> bool {
    method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD")
}

/// 保存済みレスポンスでリクエストを満たしてはならないか（§4）
///
/// `stored_req` は保存エントリの元リクエスト、`request_time` /
/// `response_time` はエントリ記録時のクロック値。
pub fn must_not_reuse(
    client_req: &Request,
    stored_req: &Request,
    stored_res: &Response,
    request_time: OffsetDateTime,
    response_time: OffsetDateTime,
    now: OffsetDateTime,
) -> Reusability {
    // 安全でないメソッドはキャッシュから応答してはならない（write-through）
    if !is_safe_method(&client_req.method) {
        return Reusability::Forward(FwdReason::Method);
    }

    // ターゲットURIの一致
    if client_req.target != stored_req.target {
        return Reusability::Forward(FwdReason::UriMiss);
    }

    // Varyで指名されたリクエストヘッダーの一致（§4.1）
    if !vary_headers_match(client_req, stored_req, stored_res) {
        return Reusability::Forward(FwdReason::VaryMiss);
    }

    // no-cacheは検証成功が条件（§5.2.2.4）
    let cc = CacheControl::from_headers(&stored_res.headers);
    if cc.has("no-cache") {
        return Reusability::Validate {
            request: conditional_request(client_req, stored_res),
            reason: FwdReason::Stale,
        };
    }

    // 新鮮でなければ検証が条件（§4.2 / §4.3）
    if !is_fresh(stored_res, response_time, request_time, now) {
        return Reusability::Validate {
            request: conditional_request(client_req, stored_res),
            reason: FwdReason::Stale,
        };
    }

    Reusability::Reuse
}

/// Varyで指名されたヘッダーがすべて一致するか（§4.1）
///
/// `*` を含むVaryは常に不一致。Accept-Encodingは特別扱いで、保存済み
/// レスポンスの `Content-Encoding: X` はリクエストの `Accept-Encoding` が
/// Xを列挙していれば一致とみなします。
fn vary_headers_match(client_req: &Request, stored_req: &Request, stored_res: &Response) -> bool {
    for member in stored_res.headers.list_values("vary") {
        if member == "*" {
            return false;
        }
        if member.eq_ignore_ascii_case("accept-encoding") {
            if let Some(encoding) = stored_res.headers.get("content-encoding") {
                let accepted = client_req
                    .headers
                    .list_values("accept-encoding")
                    .iter()
                    .any(|m| coding_name(m).eq_ignore_ascii_case(encoding.trim()));
                if !accepted {
                    return false;
                }
                continue;
            }
            // Content-Encodingなし（identity）は通常の比較にフォールバック
        }
        if !field_values_match(client_req, stored_req, &member) {
            return false;
        }
    }
    true
}

/// qvalue等のパラメータを除いたコーディング名
fn coding_name(member: &str) -> &str {
    match member.find(';') {
        Some(i) => member[..i].trim(),
        None => member.trim(),
    }
}

/// 2つのリクエスト間でヘッダーフィールドが一致するか
///
/// 正規化: OWSのトリムと同名複数行の結合。両方に存在しない場合のみ
/// 「不在同士」として一致します。
fn field_values_match(a: &Request, b: &Request, name: &str) -> bool {
    match (a.headers.combined(name), b.headers.combined(name)) {
        (None, None) => true,
        (Some(va), Some(vb)) => va == vb,
        _ => false,
    }
}

/// 検証用の条件付きリクエストを構築（§4.3.1）
///
/// 現在のクライアントリクエストを複製し、保存済みレスポンスの
/// バリデータを前提条件ヘッダーとして設定します。
pub fn conditional_request(client_req: &Request, stored_res: &Response) -> Request {
    let mut req = client_req.clone();
    req.body = Vec::new();
    req.headers.remove("content-length");
    if let Some(etag) = stored_res.headers.get("etag") {
        req.headers.set("If-None-Match", etag);
    }
    if let Some(last_modified) = stored_res.headers.get("last-modified") {
        req.headers.set("If-Modified-Since", last_modified);
    }
    req
}

/// 保存済みレスポンスからヒット応答を構築
///
/// current_ageと等しいAgeヘッダーを設定します（既存のAgeは置き換え）。
pub fn hit_response(
    stored_res: &Response,
    response_time: OffsetDateTime,
    request_time: OffsetDateTime,
    now: OffsetDateTime,
) -> Response {
    let mut res = stored_res.clone();
    let age = current_age(stored_res, response_time, request_time, now);
    res.headers.set("Age", to_delta_seconds(age));
    res
}

/// 304検証成功時の保存済みヘッダー更新（§3.2）
///
/// 304レスポンスの各ヘッダーで保存済みヘッダーを置き換えます。
/// ただしホップバイホップヘッダー、Content-Length、および保存済み
/// レスポンスが依存するフィールド（Content-Type / Content-Encoding /
/// Content-Range）は除外します。
pub fn update_stored_headers(stored: &mut Response, fresh: &Response) {
    const EXCEPTED: &[&str] = &[
        "connection",
        "proxy-connection",
        "keep-alive",
        "te",
        "transfer-encoding",
        "upgrade",
        "content-length",
        "content-type",
        "content-encoding",
        "content-range",
    ];
    let mut skip: Vec<String> = EXCEPTED.iter().map(|s| s.to_string()).collect();
    skip.extend(
        fresh
            .headers
            .list_values("connection")
            .iter()
            .map(|v| v.to_ascii_lowercase()),
    );

    let mut updated: Vec<&str> = Vec::new();
    for (name, value) in fresh.headers.iter() {
        let lower = name.to_ascii_lowercase();
        if skip.iter().any(|s| *s == lower) {
            continue;
        }
        if updated.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            // 同名複数行は最初の出現で置き換え済み、以降は追記
            stored.headers.append(name, value);
        } else {
            stored.headers.set(name, value);
            updated.push(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::format_http_date;

    fn stored_pair(cache_control: &str) -> (Request, Response, OffsetDateTime) {
        let now = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap();
        let req = Request::new("GET", "/page");
        let mut res = Response::new(200);
        res.headers.append("Date", format_http_date(now));
        res.headers.append("Cache-Control", cache_control);
        (req, res, now)
    }

    #[test]
    fn test_fresh_entry_is_reused() {
        let (stored_req, stored_res, t0) = stored_pair("max-age=60");
        let client = Request::new("GET", "/page");
        let result = must_not_reuse(&client, &stored_req, &stored_res, t0, t0, t0);
        assert_eq!(result, Reusability::Reuse);
    }

    #[test]
    fn test_unsafe_method_never_reused() {
        let (stored_req, stored_res, t0) = stored_pair("max-age=60");
        let client = Request::new("POST", "/page");
        let result = must_not_reuse(&client, &stored_req, &stored_res, t0, t0, t0);
        assert_eq!(result, Reusability::Forward(FwdReason::Method));
    }

    #[test]
    fn test_uri_mismatch() {
        let (stored_req, stored_res, t0) = stored_pair("max-age=60");
        let client = Request::new("GET", "/other");
        let result = must_not_reuse(&client, &stored_req, &stored_res, t0, t0, t0);
        assert_eq!(result, Reusability::Forward(FwdReason::UriMiss));
    }

    #[test]
    fn test_stale_entry_requires_validation() {
        let (stored_req, mut stored_res, t0) = stored_pair("max-age=1");
        stored_res.headers.append("ETag", "\"v1\"");
        let client = Request::new("GET", "/page");
        let now = t0 + time::Duration::seconds(10);
        match must_not_reuse(&client, &stored_req, &stored_res, t0, t0, now) {
            Reusability::Validate { request, reason } => {
                assert_eq!(reason, FwdReason::Stale);
                assert_eq!(request.headers.get("if-none-match"), Some("\"v1\""));
            }
            other => panic!("expected Validate, got {:?}", other),
        }
    }

    #[test]
    fn test_no_cache_forces_validation() {
        let (stored_req, mut stored_res, t0) = stored_pair("no-cache, max-age=60");
        stored_res
            .headers
            .append("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT");
        let client = Request::new("GET", "/page");
        match must_not_reuse(&client, &stored_req, &stored_res, t0, t0, t0) {
            Reusability::Validate { request, .. } => {
                assert_eq!(
                    request.headers.get("if-modified-since"),
                    Some("Mon, 01 Jan 2024 00:00:00 GMT")
                );
            }
            other => panic!("expected Validate, got {:?}", other),
        }
    }

    #[test]
    fn test_vary_star_never_matches() {
        let (stored_req, mut stored_res, t0) = stored_pair("max-age=60");
        stored_res.headers.append("Vary", "*");
        let client = Request::new("GET", "/page");
        let result = must_not_reuse(&client, &stored_req, &stored_res, t0, t0, t0);
        assert_eq!(result, Reusability::Forward(FwdReason::VaryMiss));
    }

    #[test]
    fn test_vary_header_match() {
        let (mut stored_req, mut stored_res, t0) = stored_pair("max-age=60");
        stored_res.headers.append("Vary", "Accept-Language");
        stored_req.headers.append("Accept-Language", "en-US");

        let mut client = Request::new("GET", "/page");
        client.headers.append("Accept-Language", " en-US ");
        assert_eq!(
            must_not_reuse(&client, &stored_req, &stored_res, t0, t0, t0),
            Reusability::Reuse
        );

        let mut other = Request::new("GET", "/page");
        other.headers.append("Accept-Language", "fi");
        assert_eq!(
            must_not_reuse(&other, &stored_req, &stored_res, t0, t0, t0),
            Reusability::Forward(FwdReason::VaryMiss)
        );
    }

    #[test]
    fn test_vary_absent_in_both_matches() {
        let (stored_req, mut stored_res, t0) = stored_pair("max-age=60");
        stored_res.headers.append("Vary", "Accept-Language");
        let client = Request::new("GET", "/page");
        assert_eq!(
            must_not_reuse(&client, &stored_req, &stored_res, t0, t0, t0),
            Reusability::Reuse
        );
    }

    #[test]
    fn test_vary_accept_encoding_content_encoding_match() {
        let (stored_req, mut stored_res, t0) = stored_pair("max-age=60");
        stored_res.headers.append("Vary", "Accept-Encoding");
        stored_res.headers.append("Content-Encoding", "gzip");

        let mut client = Request::new("GET", "/page");
        client.headers.append("Accept-Encoding", "br, gzip;q=0.8");
        assert_eq!(
            must_not_reuse(&client, &stored_req, &stored_res, t0, t0, t0),
            Reusability::Reuse
        );

        let mut identity = Request::new("GET", "/page");
        identity.headers.append("Accept-Encoding", "identity");
        assert_eq!(
            must_not_reuse(&identity, &stored_req, &stored_res, t0, t0, t0),
            Reusability::Forward(FwdReason::VaryMiss)
        );
    }

    #[test]
    fn test_hit_response_sets_age() {
        let (_, mut stored_res, t0) = stored_pair("max-age=60");
        stored_res.headers.append("Age", "999");
        let res = hit_response(&stored_res, t0, t0, t0 + time::Duration::seconds(30));
        let ages: Vec<_> = res.headers.values("age").collect();
        assert_eq!(ages, vec!["30"]);
    }

    #[test]
    fn test_update_stored_headers() {
        let mut stored = Response::new(200);
        stored.headers.append("Content-Type", "text/html");
        stored.headers.append("Content-Length", "100");
        stored.headers.append("Cache-Control", "max-age=1");
        stored.headers.append("ETag", "\"v1\"");

        let mut fresh = Response::new(304);
        fresh.headers.append("Cache-Control", "max-age=60");
        fresh.headers.append("Content-Type", "application/json");
        fresh.headers.append("Content-Length", "0");
        fresh.headers.append("Connection", "keep-alive");
        fresh.headers.append("Date", "Mon, 01 Jan 2024 00:00:00 GMT");

        update_stored_headers(&mut stored, &fresh);
        assert_eq!(stored.headers.get("cache-control"), Some("max-age=60"));
        // 依存フィールドとContent-Lengthは据え置き
        assert_eq!(stored.headers.get("content-type"), Some("text/html"));
        assert_eq!(stored.headers.get("content-length"), Some("100"));
        assert!(!stored.headers.contains("connection"));
        assert_eq!(stored.headers.get("etag"), Some("\"v1\""));
        assert!(stored.headers.contains("date"));
    }
}
