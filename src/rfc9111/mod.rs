//! RFC 9111（HTTP Caching）の判定エンジン群
//!
//! 保存可否（§3）、再利用可否と検証（§4）、鮮度計算（§4.2）、
//! 無効化（§4.4）、Cache-Controlパース（§5.2）を実装します。
//! この実装は共有キャッシュであり、リクエスト側のキャッシュ
//! ディレクティブは解釈しません。

mod cache_control;
mod freshness;
mod invalidation;
mod reuse;
mod storage;

pub use cache_control::CacheControl;
pub use freshness::{current_age, expires_at, freshness_lifetime, is_fresh};
pub use invalidation::{invalidate_uris, is_non_error_status, is_unsafe_request};
pub use reuse::{
    conditional_request, hit_response, is_safe_method, must_not_reuse, update_stored_headers,
    Reusability,
};
pub use storage::must_not_store;
