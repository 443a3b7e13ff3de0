//! HTTPヘッダーマップ
//!
//! 大文字小文字を区別しない、挿入順を保持するマルチバリューマップを提供します。
//! キャッシュキー計算やVaryマッチングで必要となるヘッダー書き換えのために、
//! 所有権を持つ形式で保持します。

use std::fmt;

/// HTTPヘッダーマップ
///
/// 同名ヘッダーの複数行を保持し、名前の比較はASCII大文字小文字を無視します。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    inner: Vec<(String, String)>,
}

impl HeaderMap {
    /// 空のマップを作成
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定容量で作成
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// ヘッダー行を追加（同名の既存行は保持）
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// ヘッダーを設定（同名の既存行をすべて置き換え）
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.inner.push((name, value.into()));
    }

    /// 最初の値を取得
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 同名ヘッダーのすべての値を取得
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 同名ヘッダーを削除
    ///
    /// 1行でも削除された場合にtrueを返す
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// ヘッダーが存在するか
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// ヘッダー行数（ユニーク名ではなく行数）
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 全ヘッダー行を挿入順に列挙
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// カンマ区切りリストヘッダーのメンバーを列挙
    ///
    /// 同名の複数行を結合し、各メンバーをトリムして返します。
    /// 空のメンバーは除外されます。
    pub fn list_values(&self, name: &str) -> Vec<String> {
        let mut members = Vec::new();
        for value in self.values(name) {
            for member in value.split(',') {
                let member = member.trim();
                if !member.is_empty() {
                    members.push(member.to_string());
                }
            }
        }
        members
    }

    /// 同名ヘッダーの複数行を ", " で結合した値を取得
    ///
    /// Varyマッチングの正規化（複数行の結合）に使用します。
    pub fn combined(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self.values(name).map(|v| v.trim()).collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    /// ワイヤ形式（`name: value\r\n` の連続）でバッファに書き出し
    pub fn write_wire(&self, buf: &mut Vec<u8>) {
        for (name, value) in &self.inner {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.inner {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}

// ====================
// ヘッダー衛生
// ====================

/// ホップバイホップヘッダー
///
/// オリジンへの転送時に除去するヘッダー名。`Connection` が列挙する
/// ヘッダー名もあわせて除去します。
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "transfer-encoding",
    "upgrade",
];

/// ホップバイホップヘッダーを除去
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_listed: Vec<String> = headers
        .list_values("connection")
        .iter()
        .map(|v| v.to_ascii_lowercase())
        .collect();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    for name in connection_listed {
        headers.remove(&name);
    }
}

/// 上流が不用意にエコーした X-Forwarded-* ヘッダーを除去
///
/// クライアントへのコピー時に適用します。
pub fn strip_forwarded(headers: &mut HeaderMap) {
    let forwarded: Vec<String> = headers
        .iter()
        .filter(|(k, _)| k.to_ascii_lowercase().starts_with("x-forwarded-"))
        .map(|(k, _)| k.to_string())
        .collect();
    for name in forwarded {
        headers.remove(&name);
    }
}

/// ヘッダー名が有効か検証（RFC 9110 token準拠）
#[inline]
pub fn is_valid_header_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    name.bytes().all(|b| {
        matches!(b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
            b'^' | b'_' | b'`' | b'|' | b'~' |
            b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
        )
    })
}

/// ヘッダー値が有効か検証（ヘッダーインジェクション防止）
///
/// CR, LF, NULを含む値を拒否します。obs-foldは許容しません。
#[inline]
pub fn is_valid_header_value(value: &str) -> bool {
    !value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0)
}
