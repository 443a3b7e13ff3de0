//! レスポンスキャプチャ
//!
//! 下流チャネルへの書き込みと並行してレスポンスを記録するレコーダー。
//! 検証フローでは、指定ステータス（304）に一致した場合に下流への
//! 書き込みを抑止します。生成時刻は保存エントリの `requested_at` として
//! 使用されます。

use std::io;

use time::OffsetDateTime;

use crate::http::Response;
use crate::stream::AsyncWriter;

/// 書き込みスルー型レコーダー
///
/// `downstream` が `None` の場合は記録のみ行います（バックグラウンド
/// リフレッシュでの利用形態）。`client_headers` は下流コピーにのみ
/// 付与され、記録コピーには含まれません（Cache-Statusを保存しないため）。
pub struct ResponseCapture<'a, W: AsyncWriter> {
    downstream: Option<&'a mut W>,
    status_filter: Option<u16>,
    client_headers: Vec<(String, String)>,
    status: u16,
    recorded: Vec<u8>,
    /// キャプチャ生成時刻（= オリジンへの要求開始時刻）
    pub created_at: OffsetDateTime,
}

impl<'a, W: AsyncWriter> ResponseCapture<'a, W> {
    /// 新しいキャプチャを作成
    pub fn new(downstream: Option<&'a mut W>, status_filter: Option<u16>) -> Self {
        Self {
            downstream,
            status_filter,
            client_headers: Vec::new(),
            status: 0,
            recorded: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// 下流コピーにのみ付与するヘッダーを追加
    ///
    /// 送出直前まで呼べるため、レスポンス受信後に確定する値
    /// （保存可否を含むCache-Status）も付与できます。
    pub fn client_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.client_headers.push((name.into(), value.into()));
        self
    }

    /// レスポンスを記録し、抑止されていなければ下流へ書き込む
    pub async fn send(&mut self, res: &Response) -> io::Result<()> {
        self.status = res.status;
        self.recorded = res.to_wire();

        // ステータスフィルタに一致したら以降の下流書き込みを止める
        if self.status_filter == Some(res.status) {
            self.downstream = None;
        }

        if let Some(writer) = self.downstream.as_mut() {
            let mut client_res = res.clone();
            for (name, value) in &self.client_headers {
                client_res.headers.set(name.clone(), value.clone());
            }
            let (result, _buf) = writer.write_buf(client_res.to_wire()).await;
            result?;
        }
        Ok(())
    }

    /// 記録したステータスコード
    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// 下流への書き込みが抑止されたか
    #[inline]
    pub fn suppressed(&self) -> bool {
        self.status != 0 && self.status_filter == Some(self.status)
    }

    /// 記録済みレスポンスのワイヤ形式
    #[inline]
    pub fn response_bytes(&self) -> &[u8] {
        &self.recorded
    }
}
