//! HTTP日付とdelta-seconds
//!
//! RFC 9110 §5.6.7 の3形式（IMF-fixdate / RFC 850 / asctime）のパースと、
//! IMF-fixdate形式での生成を提供します。曜日・月・タイムゾーンの
//! トークンは大文字小文字を区別せずに受理します（`gmt` を送るサーバーが
//! 実在するため）。

use time::{Date, Month, OffsetDateTime, Time};

/// delta-secondsのオーバーフロー時のセンチネル値（RFC 9111 §1.2.2）
pub const DELTA_SECONDS_OVERFLOW: i64 = 2_147_483_648;

/// ゼロ時刻（Unixエポック）
///
/// 明示的な鮮度情報を持たないエントリの `expires` に使用します。
#[inline]
pub fn zero_instant() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH
}

const MONTHS: [(&str, Month); 12] = [
    ("jan", Month::January),
    ("feb", Month::February),
    ("mar", Month::March),
    ("apr", Month::April),
    ("may", Month::May),
    ("jun", Month::June),
    ("jul", Month::July),
    ("aug", Month::August),
    ("sep", Month::September),
    ("oct", Month::October),
    ("nov", Month::November),
    ("dec", Month::December),
];

fn parse_month(token: &str) -> Option<Month> {
    let lower = token.to_ascii_lowercase();
    MONTHS
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, m)| *m)
}

fn parse_time_of_day(token: &str) -> Option<Time> {
    let mut parts = token.split(':');
    let h: u8 = parts.next()?.parse().ok()?;
    let m: u8 = parts.next()?.parse().ok()?;
    let s: u8 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Time::from_hms(h, m, s).ok()
}

fn is_gmt(token: &str) -> bool {
    token.eq_ignore_ascii_case("GMT") || token.eq_ignore_ascii_case("UTC")
}

/// HTTP日付をパース
///
/// 3つのレガシー形式をすべて受理します:
/// - IMF-fixdate: `Sun, 06 Nov 1994 08:49:37 GMT`
/// - RFC 850:     `Sunday, 06-Nov-94 08:49:37 GMT`
/// - asctime:     `Sun Nov  6 08:49:37 1994`
///
/// 不正な形式は `None`（キャッシュ上は「既に期限切れ」として扱う）。
pub fn parse_http_date(s: &str) -> Option<OffsetDateTime> {
    let tokens: Vec<&str> = s.split_ascii_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }

    if tokens[0].ends_with(',') {
        if tokens.len() == 6 {
            // IMF-fixdate: [Sun,] [06] [Nov] [1994] [08:49:37] [GMT]
            let day: u8 = tokens[1].parse().ok()?;
            let month = parse_month(tokens[2])?;
            let year: i32 = tokens[3].parse().ok()?;
            let tod = parse_time_of_day(tokens[4])?;
            if !is_gmt(tokens[5]) {
                return None;
            }
            let date = Date::from_calendar_date(year, month, day).ok()?;
            return Some(date.with_time(tod).assume_utc());
        }
        if tokens.len() == 4 {
            // RFC 850: [Sunday,] [06-Nov-94] [08:49:37] [GMT]
            let mut dmy = tokens[1].split('-');
            let day: u8 = dmy.next()?.parse().ok()?;
            let month = parse_month(dmy.next()?)?;
            let yy: i32 = dmy.next()?.parse().ok()?;
            if dmy.next().is_some() {
                return None;
            }
            // 2桁年: 70以上は1900年代、未満は2000年代と解釈
            let year = if yy >= 100 {
                yy
            } else if yy >= 70 {
                1900 + yy
            } else {
                2000 + yy
            };
            let tod = parse_time_of_day(tokens[2])?;
            if !is_gmt(tokens[3]) {
                return None;
            }
            let date = Date::from_calendar_date(year, month, day).ok()?;
            return Some(date.with_time(tod).assume_utc());
        }
        return None;
    }

    // asctime: [Sun] [Nov] [6] [08:49:37] [1994]
    if tokens.len() == 5 {
        let month = parse_month(tokens[1])?;
        let day: u8 = tokens[2].parse().ok()?;
        let tod = parse_time_of_day(tokens[3])?;
        let year: i32 = tokens[4].parse().ok()?;
        let date = Date::from_calendar_date(year, month, day).ok()?;
        return Some(date.with_time(tod).assume_utc());
    }

    None
}

/// IMF-fixdate形式でフォーマット
pub fn format_http_date(t: OffsetDateTime) -> String {
    let t = t.to_offset(time::UtcOffset::UTC);
    let weekday = match t.weekday() {
        time::Weekday::Monday => "Mon",
        time::Weekday::Tuesday => "Tue",
        time::Weekday::Wednesday => "Wed",
        time::Weekday::Thursday => "Thu",
        time::Weekday::Friday => "Fri",
        time::Weekday::Saturday => "Sat",
        time::Weekday::Sunday => "Sun",
    };
    let month = match t.month() {
        Month::January => "Jan",
        Month::February => "Feb",
        Month::March => "Mar",
        Month::April => "Apr",
        Month::May => "May",
        Month::June => "Jun",
        Month::July => "Jul",
        Month::August => "Aug",
        Month::September => "Sep",
        Month::October => "Oct",
        Month::November => "Nov",
        Month::December => "Dec",
    };
    format!(
        "{}, {:02} {} {:04} {:02}:{:02}:{:02} GMT",
        weekday,
        t.day(),
        month,
        t.year(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

/// delta-secondsをパース
///
/// 非負整数のみを受理し、オーバーフローは 2,147,483,648 にクランプします。
/// 数値として解釈できない場合は `None`。
pub fn parse_delta_seconds(s: &str) -> Option<time::Duration> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match s.parse::<i64>() {
        Ok(v) if v <= DELTA_SECONDS_OVERFLOW => Some(time::Duration::seconds(v)),
        _ => Some(time::Duration::seconds(DELTA_SECONDS_OVERFLOW)),
    }
}

/// Durationを秒数文字列に変換（Ageヘッダー生成用）
pub fn to_delta_seconds(d: time::Duration) -> String {
    let secs = d.whole_seconds().max(0);
    let mut buf = itoa::Buffer::new();
    buf.format(secs).to_string()
}
