//! 保存可否判定（RFC 9111 §3）
//!
//! 共有キャッシュとしてのMUST-NOT-STORE条件を実装します。
//! ヒューリスティックキャッシュは行わないため、明示的な鮮度情報
//! （public / Expires / max-age / s-maxage）のないレスポンスは保存しません。

use super::cache_control::CacheControl;
use crate::http::{Request, Response};

/// このキャッシュが理解するリクエストメソッドか
fn method_is_understood(method: &str) -> bool {
    matches!(method, "GET" | "POST")
}

/// このキャッシュが理解するレスポンスステータスか
fn status_is_understood(status: u16) -> bool {
    status == 200
}

/// ステータスコードがfinalか（1xx以外）
fn status_is_final(status: u16) -> bool {
    (200..=599).contains(&status)
}

/// 206/304またはmust-understand指定時にステータス理解を要求（§3）
fn status_understood_if_needed(status: u16, cc: &CacheControl) -> bool {
    if status == 206 || status == 304 || cc.has("must-understand") {
        status_is_understood(status)
    } else {
        true
    }
}

/// レスポンスを保存してはならないか（§3）
///
/// 以下のすべてを満たす場合のみ保存可能:
/// - リクエストメソッドを理解している
/// - ステータスコードがfinal
/// - 206/304またはmust-understand時: ステータスを理解している
/// - no-storeがない
/// - privateがない（共有キャッシュのため）
/// - リクエストにAuthorizationがある場合: public / s-maxage /
///   must-revalidateのいずれかがある
/// - public / Expires / max-age / s-maxageのいずれかがある
pub fn must_not_store(req: &Request, res: &Response) -> bool {
    let cc = CacheControl::from_headers(&res.headers);

    let storable = method_is_understood(&req.method)
        && status_is_final(res.status)
        && status_understood_if_needed(res.status, &cc)
        && !cc.has("no-store")
        && !cc.has("private")
        && (req.headers.get("authorization").is_none()
            || cc.has("public")
            || cc.has("s-maxage")
            || cc.has("must-revalidate"))
        && (cc.has("public")
            || res.headers.contains("expires")
            || cc.has("max-age")
            || cc.has("s-maxage"));

    !storable
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_request() -> Request {
        Request::new("GET", "/")
    }

    fn response(status: u16, cache_control: Option<&str>) -> Response {
        let mut res = Response::new(status);
        if let Some(cc) = cache_control {
            res.headers.append("Cache-Control", cc);
        }
        res
    }

    #[test]
    fn test_storable_with_max_age() {
        assert!(!must_not_store(
            &get_request(),
            &response(200, Some("max-age=60"))
        ));
    }

    #[test]
    fn test_no_store() {
        assert!(must_not_store(
            &get_request(),
            &response(200, Some("no-store, max-age=60"))
        ));
    }

    #[test]
    fn test_private_in_shared_cache() {
        assert!(must_not_store(
            &get_request(),
            &response(200, Some("private, max-age=60"))
        ));
    }

    #[test]
    fn test_no_explicit_freshness() {
        // ヒューリスティックキャッシュはしない
        assert!(must_not_store(&get_request(), &response(200, None)));
    }

    #[test]
    fn test_expires_alone_is_enough() {
        let mut res = response(200, None);
        res.headers
            .append("Expires", "Thu, 01 Dec 2094 16:00:00 GMT");
        assert!(!must_not_store(&get_request(), &res));
    }

    #[test]
    fn test_method_not_understood() {
        let req = Request::new("DELETE", "/");
        assert!(must_not_store(&req, &response(200, Some("max-age=60"))));
    }

    #[test]
    fn test_non_final_status() {
        assert!(must_not_store(
            &get_request(),
            &response(100, Some("max-age=60"))
        ));
    }

    #[test]
    fn test_partial_content_not_understood() {
        assert!(must_not_store(
            &get_request(),
            &response(206, Some("max-age=60"))
        ));
    }

    #[test]
    fn test_must_understand_with_200() {
        assert!(!must_not_store(
            &get_request(),
            &response(200, Some("must-understand, max-age=60"))
        ));
    }

    #[test]
    fn test_must_understand_with_404() {
        assert!(must_not_store(
            &get_request(),
            &response(404, Some("must-understand, max-age=60"))
        ));
    }

    #[test]
    fn test_authorization_requires_explicit_allowance() {
        let mut req = get_request();
        req.headers.append("Authorization", "Bearer token");
        assert!(must_not_store(&req, &response(200, Some("max-age=60"))));
        assert!(!must_not_store(
            &req,
            &response(200, Some("public, max-age=60"))
        ));
        assert!(!must_not_store(&req, &response(200, Some("s-maxage=60"))));
        // must-revalidateは保存を許すが、鮮度情報は別途必要
        let mut res = response(200, Some("must-revalidate"));
        res.headers
            .append("Expires", "Thu, 01 Dec 2094 16:00:00 GMT");
        assert!(!must_not_store(&req, &res));
    }
}
