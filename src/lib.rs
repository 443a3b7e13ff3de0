//! # acache
//!
//! RFC 9111準拠の共有キャッシュリバースプロキシです。保存・再利用の
//! 判定に加えて、期限切れ前のバックグラウンド再取得と、オリジンが返す
//! `Cache-Update` ヘッダーによるオンデマンド更新で、安定したリソースの
//! ヒット率を100%に近づけます。キャッシュ処遇はRFC 9211の
//! `Cache-Status` ヘッダーで報告します。
//!
//! ## 構成
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  AlwaysCache (proxy)                          │
//! │  ├─ CacheKeyer          ← キー導出            │
//! │  ├─ rfc9111::*          ← 保存/再利用/鮮度    │
//! │  ├─ CacheStore          ← memory / LMDB       │
//! │  ├─ client              ← オリジン転送        │
//! │  └─ update_loop         ← 先回りリフレッシュ  │
//! └───────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod client;
pub mod config;
pub mod http;
pub mod keyer;
pub mod proxy;
pub mod rfc9111;
pub mod rfc9211;
pub mod rules;
mod scheduler;
pub mod serializer;
pub mod server;
pub mod store;
pub mod stream;
pub mod update;

pub use config::{Origin, ProxyConfig};
pub use proxy::AlwaysCache;
