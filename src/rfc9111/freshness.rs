//! 鮮度計算（RFC 9111 §4.2）
//!
//! freshness_lifetime（§4.2.1）とcurrent_age（§4.2.3）を仕様の算術どおりに
//! 実装します。ヒューリスティック鮮度（§4.2.2）は適用しません。明示的な
//! 鮮度情報を持たないレスポンスは保存されません。

use time::{Duration, OffsetDateTime};

use super::cache_control::CacheControl;
use crate::http::{parse_delta_seconds, parse_http_date, zero_instant, Response};

/// freshness_lifetimeを計算（§4.2.1）
///
/// 優先順位: s-maxage（共有キャッシュ）> max-age > Expires - Date。
/// いずれも存在しなければ0（明示的な有効期限なし）。
pub fn freshness_lifetime(res: &Response) -> Duration {
    let cc = CacheControl::from_headers(&res.headers);
    if let Some(val) = cc.s_maxage() {
        return val;
    }
    if let Some(val) = cc.max_age() {
        return val;
    }
    // Expiresの不正な日付は「既に期限切れ」を意味する（§5.3）
    if let Some(expires_header) = res.headers.get("expires") {
        if let Some(date_header) = res.headers.get("date") {
            if let Some(date) = parse_http_date(date_header) {
                let expires =
                    parse_http_date(expires_header).unwrap_or_else(zero_instant);
                return expires - date;
            }
        }
    }
    Duration::ZERO
}

/// current_ageを計算（§4.2.3）
///
/// `response_time` / `request_time` は保存エントリに記録された受信時刻と
/// 要求時刻。`Date` ヘッダーは到着時に補完されるため常に存在する前提だが、
/// 欠けている場合は `response_time` で代用します。
pub fn current_age(
    res: &Response,
    response_time: OffsetDateTime,
    request_time: OffsetDateTime,
    now: OffsetDateTime,
) -> Duration {
    let age_value = res
        .headers
        .get("age")
        .and_then(parse_delta_seconds)
        .unwrap_or(Duration::ZERO);
    let date_value = res
        .headers
        .get("date")
        .and_then(parse_http_date)
        .unwrap_or(response_time);

    let apparent_age = (response_time - date_value).max(Duration::ZERO);
    let response_delay = response_time - request_time;
    let corrected_age_value = age_value + response_delay;
    let corrected_initial_age = apparent_age.max(corrected_age_value);
    let resident_time = now - response_time;
    corrected_initial_age + resident_time
}

/// レスポンスが新鮮か（§4.2: freshness_lifetime > current_age）
pub fn is_fresh(
    res: &Response,
    response_time: OffsetDateTime,
    request_time: OffsetDateTime,
    now: OffsetDateTime,
) -> bool {
    freshness_lifetime(res) > current_age(res, response_time, request_time, now)
}

/// 有効期限の絶対時刻を計算
///
/// freshness_lifetimeが正のとき `now + lifetime`、それ以外はゼロ時刻。
/// ゼロ時刻のエントリはストアに書き込まれません。
pub fn expires_at(res: &Response, now: OffsetDateTime) -> OffsetDateTime {
    let lifetime = freshness_lifetime(res);
    if lifetime > Duration::ZERO {
        now + lifetime
    } else {
        zero_instant()
    }
}
