//! Cache-Updateヘッダー
//!
//! オリジンが安全でないリクエストへの応答で `Cache-Update` を返すと、
//! 指定パスのキャッシュを（任意の遅延の後に）リフレッシュします。
//! 値の先頭フィールド（セミコロン区切り）がパスで、リクエストURLに対する
//! 相対参照を許容します。`delay=N` ディレクティブで遅延秒数を指定できます。

use std::time::Duration;

use crate::http::{Request, Response};
use crate::rfc9111::{is_non_error_status, is_unsafe_request};

/// 1件のキャッシュ更新指示
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUpdate {
    /// 更新対象のパス（origin-form）
    pub path: String,
    /// 更新までの遅延（0で即時）
    pub delay: Duration,
}

/// レスポンスからCache-Update指示を抽出
///
/// 安全でないリクエストへの非エラー応答（2xx/3xx）でのみ有効です。
pub fn cache_updates(req: &Request, res: &Response) -> Vec<CacheUpdate> {
    if !is_unsafe_request(req) || !is_non_error_status(res.status) {
        return Vec::new();
    }
    res.headers
        .values("cache-update")
        .map(|value| CacheUpdate {
            path: resolve_path(&req.target, update_path(value)),
            delay: update_delay(value),
        })
        .collect()
}

/// 値の先頭フィールド（パス部分）
fn update_path(value: &str) -> &str {
    match value.find(';') {
        Some(i) => value[..i].trim(),
        None => value.trim(),
    }
}

/// `delay=N` ディレクティブ（秒、非負整数）を取得
fn update_delay(value: &str) -> Duration {
    for field in value.split(';').skip(1) {
        let field = field.trim();
        if let Some((name, arg)) = field.split_once('=') {
            if name.trim().eq_ignore_ascii_case("delay") {
                if let Ok(seconds) = arg.trim().parse::<u64>() {
                    return Duration::from_secs(seconds);
                }
            }
        }
    }
    Duration::ZERO
}

/// 相対参照をリクエストターゲットに対して解決し、パス部分を返す
fn resolve_path(base_target: &str, reference: &str) -> String {
    // 解決結果はパスのみ（クエリは落とす）
    let reference = match reference.find('?') {
        Some(i) => &reference[..i],
        None => reference,
    };
    if reference.starts_with('/') {
        return reference.to_string();
    }
    if reference.is_empty() {
        return base_path(base_target).to_string();
    }
    // 相対パスはベースの最後のセグメントを置き換える（RFC 3986のマージ）
    let base = base_path(base_target);
    match base.rfind('/') {
        Some(i) => format!("{}{}", &base[..i + 1], reference),
        None => format!("/{}", reference),
    }
}

fn base_path(target: &str) -> &str {
    match target.find('?') {
        Some(i) => &target[..i],
        None => target,
    }
}
