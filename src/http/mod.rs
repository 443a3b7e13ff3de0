//! HTTP/1.1メッセージ基盤
//!
//! ヘッダーマップ、メッセージ型、HTTP日付、chunkedデコーダを提供します。
//! キャッシュの保存形式はHTTP/1.1ワイヤ形式のため、すべての層が
//! このモジュールの型を共有します。

mod chunked;
mod date;
mod header;
mod message;

pub use chunked::ChunkedDecoder;
pub use date::{
    format_http_date, parse_delta_seconds, parse_http_date, to_delta_seconds, zero_instant,
    DELTA_SECONDS_OVERFLOW,
};
pub use header::{
    is_valid_header_name, is_valid_header_value, strip_forwarded, strip_hop_by_hop, HeaderMap,
};
pub use message::{content_length, is_chunked, status_text, Request, Response, WireError};
