//! キャッシュキー
//!
//! キーの構造（区切りは固定）:
//!
//! ```text
//! <origin-id> ":" <method> ":" <uri> "\t" [<body-fingerprint>][<cache-key>]
//!     ["\n" <vary-header-name-lower> ": " <value>]*
//! ```
//!
//! `\t` より前がバリアントファミリ（キープレフィックス）、以降がVary軸です。
//! origin-idにより単一ストア内で複数オリジンのキャッシュを分離します。

use sha2::{Digest, Sha256};

use crate::http::{HeaderMap, Request, Response};

const ORIGIN_SEPARATOR: char = ':';
const METHOD_SEPARATOR: char = ':';
const VARY_SEPARATOR: char = '\t';

/// キー操作のエラー
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    /// GET以外のキーからはリクエストを再構築できない
    #[error("method not supported")]
    MethodNotSupported,
    /// キーの構造が不正
    #[error("malformed key: {0}")]
    Malformed(String),
}

/// キャッシュキー生成器
///
/// origin-id文字列のみをパラメータとするステートレスな生成器。
#[derive(Debug, Clone)]
pub struct CacheKeyer {
    origin_id: String,
    origin_prefix: String,
}

impl CacheKeyer {
    /// origin-idを指定して作成
    pub fn new(origin_id: impl Into<String>) -> Self {
        let origin_id = origin_id.into();
        let origin_prefix = format!("{}{}", origin_id, ORIGIN_SEPARATOR);
        Self {
            origin_id,
            origin_prefix,
        }
    }

    /// このオリジンの全キーのプレフィックス
    #[inline]
    pub fn origin_prefix(&self) -> &str {
        &self.origin_prefix
    }

    /// 指定メソッドの全キーのプレフィックス
    ///
    /// 例: リフレッシュループはGETのプレフィックスだけを走査します。
    pub fn method_prefix(&self, method: &str) -> String {
        format!(
            "{}{}{}{}",
            self.origin_id, ORIGIN_SEPARATOR, method, METHOD_SEPARATOR
        )
    }

    /// リクエストからキープレフィックスを導出
    ///
    /// バリアント検索（Vary軸を除いたキー）に適した形。POSTはボディの
    /// フィンガープリントを付加し、`Cache-Key` ヘッダーがあればその値を
    /// そのまま付加します。
    pub fn key_prefix(&self, req: &Request) -> String {
        let mut key = format!(
            "{}{}{}{}{}{}",
            self.origin_id,
            ORIGIN_SEPARATOR,
            req.method,
            METHOD_SEPARATOR,
            req.target,
            VARY_SEPARATOR
        );
        if req.method == "POST" {
            key.push_str(&body_fingerprint(req));
        }
        if let Some(ck) = req.headers.get("cache-key") {
            key.push_str(ck);
        }
        key
    }

    /// プレフィックスにVary軸を加えたフルキーを導出
    ///
    /// レスポンスのVaryが指名するヘッダーのうち、リクエストに存在する
    /// ものを `\n名前: 値` 形式で追加します。`*` を含む場合は以後の
    /// どのリクエストとも一致しないキーを生成します。
    pub fn add_vary(&self, prefix: &str, req: &Request, res: &Response) -> String {
        let mut key = prefix.to_string();
        for name in res.headers.list_values("vary") {
            if name == "*" {
                // どのリクエストからも再生成できないキーにする
                key.push('\n');
                key.push('*');
                continue;
            }
            if let Some(value) = req.headers.get(&name) {
                key.push('\n');
                key.push_str(&name.to_ascii_lowercase());
                key.push_str(": ");
                key.push_str(value);
            }
        }
        key
    }

    /// キーからキャッシュ的に等価なリクエストを再構築
    ///
    /// Vary軸のヘッダーを復元したGETリクエストを返します。GET以外の
    /// メソッドは安全に再実行できないため `MethodNotSupported`。
    pub fn request_from_key(&self, key: &str) -> Result<Request, KeyError> {
        let rest = key
            .strip_prefix(&self.origin_prefix)
            .ok_or_else(|| KeyError::Malformed(format!("key and origin do not match: {}", key)))?;
        let (method_uri, after_tab) = rest
            .split_once(VARY_SEPARATOR)
            .ok_or_else(|| KeyError::Malformed(key.to_string()))?;
        let (method, uri) = method_uri
            .split_once(METHOD_SEPARATOR)
            .ok_or_else(|| KeyError::Malformed(key.to_string()))?;
        if method != "GET" {
            return Err(KeyError::MethodNotSupported);
        }
        let mut headers = HeaderMap::new();
        // `\t` と最初のVary行の間はCache-Keyヘッダー由来の値
        let mut lines = after_tab.split('\n');
        if let Some(cache_key) = lines.next() {
            if !cache_key.is_empty() {
                headers.set("Cache-Key", cache_key);
            }
        }
        for line in lines {
            if line == "*" {
                continue;
            }
            let (name, value) = line
                .split_once(": ")
                .ok_or_else(|| KeyError::Malformed(line.to_string()))?;
            headers.append(name, value);
        }
        let mut req = Request::new(method, uri);
        req.headers = headers;
        Ok(req)
    }
}

/// POSTボディのフィンガープリントを計算
///
/// `Content-Type` が `multipart/` で始まる場合は最初のパートの内容のみを
/// ハッシュします（multipartアップロードは先頭パートに冪等性メタデータを
/// 置く運用のため）。それ以外はボディ全体のSHA-256。
pub fn body_fingerprint(req: &Request) -> String {
    if let Some(content_type) = req.headers.get("content-type") {
        if content_type
            .trim_start()
            .to_ascii_lowercase()
            .starts_with("multipart/")
        {
            if let Some(part) = first_multipart_part(content_type, &req.body) {
                return sha256_hex(part);
            }
        }
    }
    sha256_hex(&req.body)
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// 最初のmultipartパートの内容（パートヘッダーを除く）を切り出す
fn first_multipart_part<'a>(content_type: &str, body: &'a [u8]) -> Option<&'a [u8]> {
    let boundary = multipart_boundary(content_type)?;
    let delimiter = format!("--{}", boundary);
    let start = find_subsequence(body, delimiter.as_bytes())?;
    let after_delim = &body[start + delimiter.len()..];
    // 境界行の行末をスキップ
    let after_line = after_delim.strip_prefix(b"\r\n").or_else(|| {
        after_delim.strip_prefix(b"\n")
    })?;
    // パートヘッダーと内容は空行で区切られる
    let content_start = find_subsequence(after_line, b"\r\n\r\n").map(|i| i + 4)?;
    let content = &after_line[content_start..];
    let content_end = find_subsequence(content, delimiter.as_bytes())?;
    // 内容末尾のCRLFは境界の一部
    let mut end = content_end;
    if end >= 2 && &content[end - 2..end] == b"\r\n" {
        end -= 2;
    }
    Some(&content[..end])
}

/// Content-Typeパラメータからboundaryを取得
fn multipart_boundary(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        if let Some(value) = param
            .strip_prefix("boundary=")
            .or_else(|| param.strip_prefix("BOUNDARY="))
        {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
