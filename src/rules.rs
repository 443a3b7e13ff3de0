//! レスポンス書き換えルール
//!
//! YAMLで記述されたルールにより、オリジンレスポンスへ保存・転送前に
//! `Cache-Control` の上書き・補完や任意ヘッダーの付与を行います。
//! ルールは上から順に評価され、最初に一致したものだけが適用されます。
//! ステータス200のGETレスポンスのみが対象です。

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::http::{Request, Response};

/// 1件の書き換えルール
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    /// パスのプレフィックス一致
    #[serde(default)]
    pub prefix: String,
    /// パスの完全一致
    #[serde(default)]
    pub path: String,
    /// Cache-Controlが無い場合に補うデフォルト値
    #[serde(default)]
    pub default: String,
    /// Cache-Controlを無条件に上書きする値
    #[serde(default)]
    pub r#override: String,
    /// クエリパラメータ条件（値が空なら存在のみ要求）
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// 付与するヘッダー
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// ルールの順序付きリスト
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Rules(pub Vec<Rule>);

/// ルール読み込みのエラー
#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("cannot read rules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse rules file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl Rules {
    /// YAMLファイルから読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RulesError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// ルールを適用（200のみ対象）
    pub fn apply(&self, req: &Request, res: &mut Response) {
        if res.status != 200 {
            return;
        }
        if let Some(rule) = self.find(req) {
            if !rule.r#override.is_empty() {
                ftlog::trace!("Overriding Cache-Control header");
                res.headers.set("Cache-Control", &rule.r#override);
            } else if !rule.default.is_empty() && res.headers.get("cache-control").is_none() {
                ftlog::trace!("Applying default Cache-Control header");
                res.headers.set("Cache-Control", &rule.default);
            }
            for (name, value) in &rule.headers {
                ftlog::trace!("Setting header {}", name);
                res.headers.set(name, value);
            }
        }
    }

    fn find(&self, req: &Request) -> Option<&Rule> {
        if req.method != "GET" {
            return None;
        }
        'rules: for rule in &self.0 {
            if !rule.path.is_empty() && rule.path != req.path() {
                continue;
            }
            if !rule.prefix.is_empty() && !req.path().starts_with(&rule.prefix) {
                continue;
            }
            if !rule.query.is_empty() {
                let pairs = query_pairs(req.query().unwrap_or(""));
                for (name, value) in &rule.query {
                    match pairs.iter().find(|(n, _)| n == name) {
                        None => continue 'rules,
                        Some((_, actual)) if !value.is_empty() && actual != value => {
                            continue 'rules
                        }
                        Some(_) => {}
                    }
                }
            }
            return Some(rule);
        }
        None
    }
}

fn query_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((n, v)) => (n.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
