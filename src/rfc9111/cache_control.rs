//! Cache-Controlディレクティブ（RFC 9111 §5.2）
//!
//! トークンは大文字小文字を区別せず比較し、引数はtoken形式と
//! quoted-string形式の両方を受理します。同一ディレクティブが複数回
//! 現れた場合は最後の出現が有効です。

use std::collections::HashMap;

use crate::http::{parse_delta_seconds, HeaderMap};

/// 1つ以上のCache-Controlフィールド値をパースしたディレクティブマップ
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    directives: HashMap<String, Option<String>>,
}

impl CacheControl {
    /// Cache-Controlフィールド値の集合からパース
    pub fn parse<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut directives = HashMap::new();
        for value in values {
            for directive in value.split(',') {
                let directive = directive.trim();
                if directive.is_empty() {
                    continue;
                }
                match directive.split_once('=') {
                    Some((name, arg)) => {
                        directives.insert(
                            name.trim().to_ascii_lowercase(),
                            Some(arg.trim().trim_matches('"').to_string()),
                        );
                    }
                    None => {
                        directives.insert(directive.to_ascii_lowercase(), None);
                    }
                }
            }
        }
        Self { directives }
    }

    /// レスポンスヘッダーからパース
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::parse(headers.values("cache-control"))
    }

    /// ディレクティブの存在確認（大文字小文字を区別しない）
    #[inline]
    pub fn has(&self, directive: &str) -> bool {
        self.directives.contains_key(&directive.to_ascii_lowercase())
    }

    /// ディレクティブの引数を取得
    ///
    /// ディレクティブ自体が存在しない場合と、引数なしで存在する場合の
    /// 両方で `None` を返します。
    pub fn arg(&self, directive: &str) -> Option<&str> {
        self.directives
            .get(&directive.to_ascii_lowercase())
            .and_then(|v| v.as_deref())
    }

    /// max-ageディレクティブの値
    ///
    /// ディレクティブが存在し引数が不正な場合は0秒（= stale扱い）。
    pub fn max_age(&self) -> Option<time::Duration> {
        self.delta_directive("max-age")
    }

    /// s-maxageディレクティブの値
    pub fn s_maxage(&self) -> Option<time::Duration> {
        self.delta_directive("s-maxage")
    }

    fn delta_directive(&self, name: &str) -> Option<time::Duration> {
        if !self.has(name) {
            return None;
        }
        Some(
            self.arg(name)
                .and_then(parse_delta_seconds)
                .unwrap_or(time::Duration::ZERO),
        )
    }
}
