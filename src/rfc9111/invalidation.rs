//! 保存済みレスポンスの無効化（RFC 9111 §4.4）
//!
//! 安全でないメソッドへの非エラー応答（2xx/3xx）を観測したとき、
//! ターゲットURIと、同一オリジンに限ってLocation / Content-LocationのURIを
//! 無効化候補として導出します。オリジンが異なるURIを無効化してはならない
//! （DoS防止）。

use super::reuse::is_safe_method;
use crate::http::{Request, Response};

/// 安全でない（状態を変更しうる）メソッドか
#[inline]
pub fn is_unsafe_request(req: &Request) -> bool {
    !is_safe_method(&req.method)
}

/// 非エラー応答か（2xx / 3xx）
#[inline]
pub fn is_non_error_status(status: u16) -> bool {
    (200..=399).contains(&status)
}

/// 無効化すべきURI（origin-form）を導出
///
/// 安全でないリクエストへの非エラー応答でなければ空を返します。
pub fn invalidate_uris(req: &Request, res: &Response) -> Vec<String> {
    if !is_unsafe_request(req) || !is_non_error_status(res.status) {
        return Vec::new();
    }

    let mut uris = vec![req.target.clone()];
    for name in ["location", "content-location"] {
        if let Some(value) = res.headers.get(name) {
            if let Some(uri) = same_origin_target(value.trim(), req) {
                if !uris.iter().any(|u| u == &uri) {
                    uris.push(uri);
                }
            }
        }
    }
    uris
}

/// URI参照が同一オリジンであればorigin-formに変換
///
/// 相対参照（`/`始まり）は同一オリジン。絶対URIはauthorityがリクエストの
/// Hostヘッダーと一致する場合のみ受理します。
fn same_origin_target(reference: &str, req: &Request) -> Option<String> {
    if reference.starts_with('/') {
        return Some(reference.to_string());
    }
    let rest = reference
        .strip_prefix("http://")
        .or_else(|| reference.strip_prefix("https://"))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let host = req.headers.get("host")?;
    if authority.eq_ignore_ascii_case(host.trim()) {
        Some(path.to_string())
    } else {
        None
    }
}
