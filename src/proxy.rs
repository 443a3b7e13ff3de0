//! プロキシハンドラ
//!
//! クライアントリクエストごとの合成層。キー導出 → バリアント列挙 →
//! 再利用判定（直接再利用 / 304検証 / 不可）→ ミス時のオリジン転送と
//! 保存・無効化・Cache-Update処理、という流れを実装します。
//! キャッシュ側の障害はリクエストフローを壊さず、素通し転送に
//! フォールバックします。

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashSet;
use ftlog::{debug, error, trace, warn};
use futures::FutureExt;
use monoio::net::TcpStream;
use monoio::time::timeout;
use time::OffsetDateTime;

use crate::capture::ResponseCapture;
use crate::client;
use crate::config::{Origin, ProxyConfig};
use crate::http::{
    content_length, format_http_date, is_chunked, strip_forwarded, strip_hop_by_hop,
    ChunkedDecoder, HeaderMap, Request, Response,
};
use crate::keyer::CacheKeyer;
use crate::rfc9111::{
    expires_at, hit_response, invalidate_uris, must_not_reuse, must_not_store,
    update_stored_headers, Reusability,
};
use crate::rfc9211::{CacheStatus, FwdReason};
use crate::rules::Rules;
use crate::serializer::{self, TimedResponse};
use crate::store::{CacheEntry, CacheStore};
use crate::stream::{AsyncReader, AsyncWriter};
use crate::update::cache_updates;

/// 読み込みバッファサイズ
const BUF_SIZE: usize = 65536;

/// リクエストヘッダー部の上限
const MAX_HEADER_SIZE: usize = 8192;

/// リクエストボディの上限
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// アイドル接続のタイムアウト
const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// クライアント書き込みのタイムアウト
const WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// 一括更新のトリガーとなる管理エンドポイント
const UPDATE_ALL_ENDPOINT: &str = "/.acache-update";

/// リクエスト修飾フック
///
/// キャッシュ参照の前に呼ばれ、`Cache-Key` ヘッダーの設定などで
/// キー導出に介入できます。
pub type RequestModifier = Arc<dyn Fn(&mut Request) + Send + Sync>;

/// レスポンス修飾フック
///
/// 保存・転送の前にオリジンレスポンスへ適用されます。
pub type ResponseModifier = Arc<dyn Fn(&Request, &mut Response) + Send + Sync>;

/// キャッシュ付きリバースプロキシ本体
pub struct AlwaysCache {
    pub(crate) store: Arc<dyn CacheStore>,
    pub(crate) keyer: CacheKeyer,
    pub(crate) origin: Origin,
    /// リフレッシュ走査の地平線。`None` はレガシーモード
    pub(crate) update_timeout: Option<std::time::Duration>,
    rules: Rules,
    request_modifier: Option<RequestModifier>,
    response_modifier: Option<ResponseModifier>,
    /// 進行中リフレッシュの合流用（同一キーの二重更新を防ぐ）
    pub(crate) inflight: DashSet<String>,
}

impl AlwaysCache {
    /// 設定からプロキシを構築
    pub fn new(config: &ProxyConfig) -> Result<Self, crate::store::StoreError> {
        let store = crate::store::open_store(&config.db)?;
        Ok(Self::with_store(config, store))
    }

    /// ストアを注入して構築（テストおよび組み込み用）
    pub fn with_store(config: &ProxyConfig, store: Arc<dyn CacheStore>) -> Self {
        let origin_id = config
            .cache_key
            .clone()
            .unwrap_or_else(|| config.origin.id());
        Self {
            store,
            keyer: CacheKeyer::new(origin_id),
            origin: config.origin.clone(),
            update_timeout: config.update_timeout,
            rules: config.rules.clone(),
            request_modifier: None,
            response_modifier: None,
            inflight: DashSet::new(),
        }
    }

    /// リクエスト修飾フックを設定
    pub fn with_request_modifier(mut self, modifier: RequestModifier) -> Self {
        self.request_modifier = Some(modifier);
        self
    }

    /// レスポンス修飾フックを設定
    pub fn with_response_modifier(mut self, modifier: ResponseModifier) -> Self {
        self.response_modifier = Some(modifier);
        self
    }

    // ====================
    // 接続処理
    // ====================

    /// 1本のクライアント接続を処理（Keep-Aliveループ）
    pub async fn serve_connection(self: Arc<Self>, mut stream: TcpStream) {
        let mut accumulated: Vec<u8> = Vec::with_capacity(BUF_SIZE);

        loop {
            let parsed = loop {
                if !accumulated.is_empty() {
                    match parse_client_request(&accumulated) {
                        Ok(Some(parsed)) => break Some(parsed),
                        Ok(None) => {}
                        Err(status) => {
                            let _ = write_error(&mut stream, status).await;
                            return;
                        }
                    }
                }
                let buf = vec![0u8; BUF_SIZE];
                let read_result = timeout(IDLE_TIMEOUT, stream.read_buf(buf)).await;
                let (result, returned) = match read_result {
                    Ok(r) => r,
                    // アイドルタイムアウト - 接続を閉じる
                    Err(_) => return,
                };
                let n = match result {
                    Ok(0) | Err(_) => break None,
                    Ok(n) => n,
                };
                accumulated.extend_from_slice(&returned[..n]);
            };

            let Some((req, consumed, client_keep_alive)) = parsed else {
                return;
            };
            accumulated.drain(..consumed);

            let keep_alive = self.handle_request(req, &mut stream, client_keep_alive).await;
            if !keep_alive {
                return;
            }
        }
    }

    /// 1リクエストを処理。戻り値は接続を維持するか
    async fn handle_request(
        self: &Arc<Self>,
        mut req: Request,
        stream: &mut TcpStream,
        client_keep_alive: bool,
    ) -> bool {
        if req.target == UPDATE_ALL_ENDPOINT {
            let cache = self.clone();
            monoio::spawn(async move {
                cache.update_all().await;
            });
            let mut cs = CacheStatus::new();
            cs.forward(FwdReason::Bypass);
            let res = Response::new(202);
            return self
                .write_response(stream, &req, res, &cs, client_keep_alive)
                .await;
        }

        // 信頼できないクライアントからのCache-Keyはキャッシュ汚染防止のため
        // 破棄し、信頼される修飾フックだけが設定できるようにする
        req.headers.remove("cache-key");
        if let Some(modifier) = &self.request_modifier {
            modifier(&mut req);
        }

        // キャッシュ経路のパニックはここで回収する。キャッシュの不具合が
        // リクエストフローを壊してはならない
        let outcome = AssertUnwindSafe(self.serve_request(&req, stream, client_keep_alive))
            .catch_unwind()
            .await;
        match outcome {
            Ok(keep_alive) => keep_alive,
            Err(_) => {
                error!("Panic in cache handler: {} {}", req.method, req.target);
                self.escape_hatch(&req, stream).await
            }
        }
    }

    /// キャッシュ経路の本体（パニック回収の内側）
    async fn serve_request(
        self: &Arc<Self>,
        req: &Request,
        stream: &mut TcpStream,
        client_keep_alive: bool,
    ) -> bool {
        match self.serve_from_cache(req, stream, client_keep_alive).await {
            Some(keep_alive) => keep_alive,
            None => self.forward_miss(req, stream, client_keep_alive).await,
        }
    }

    /// 素通しのエスケープハッチ
    ///
    /// キャッシュ処理を一切介さずオリジンへ転送するフォールバック。
    /// 接続の状態は保証できないため、応答後は必ず閉じます。
    async fn escape_hatch(&self, req: &Request, stream: &mut TcpStream) -> bool {
        match client::fetch(&self.origin, req).await {
            Ok(mut res) => {
                if !req.method.eq_ignore_ascii_case("HEAD") {
                    res.headers
                        .set("Content-Length", res.body.len().to_string());
                }
                res.headers.set("Connection", "close");
                let _ = timeout(WRITE_TIMEOUT, stream.write_buf(res.to_wire())).await;
                false
            }
            Err(e) => {
                error!("Error connecting to origin: {}", e);
                let _ = write_error(stream, 502).await;
                false
            }
        }
    }

    // ====================
    // キャッシュからの応答
    // ====================

    /// 保存済みバリアントからの応答を試みる
    ///
    /// 応答を書き込んだ場合は `Some(keep_alive)`、どのバリアントでも
    /// 満たせない場合は `None` を返します。
    async fn serve_from_cache(
        self: &Arc<Self>,
        req: &Request,
        stream: &mut TcpStream,
        client_keep_alive: bool,
    ) -> Option<bool> {
        let prefix = self.keyer.key_prefix(req);
        let entries = match self.store.all(&prefix) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Could not retrieve from cache: {}", e);
                return None;
            }
        };

        for entry in entries {
            let timed = match serializer::from_bytes(&entry.bytes) {
                Ok(timed) => timed,
                Err(e) => {
                    // 壊れたエントリはパージしてミス扱い
                    warn!("Could not read stored entry {}: {}", entry.key, e);
                    self.store.purge(&entry.key);
                    continue;
                }
            };
            let Some(stored_req) = timed.request.clone() else {
                error!("Stored entry has no request: {}", entry.key);
                self.store.purge(&entry.key);
                continue;
            };

            let now = OffsetDateTime::now_utc();
            match must_not_reuse(
                req,
                &stored_req,
                &timed.response,
                timed.request_time,
                timed.response_time,
                now,
            ) {
                Reusability::Reuse => {
                    let mut cs = CacheStatus::new();
                    cs.hit().ttl((entry.expires - now).whole_seconds());
                    let res = hit_response(
                        &timed.response,
                        timed.response_time,
                        timed.request_time,
                        now,
                    );
                    return Some(
                        self.write_response(stream, req, res, &cs, client_keep_alive)
                            .await,
                    );
                }
                Reusability::Validate { request, .. } => {
                    return Some(
                        self.validate_and_serve(
                            req,
                            request,
                            &entry,
                            timed,
                            stream,
                            client_keep_alive,
                        )
                        .await,
                    );
                }
                Reusability::Forward(reason) => {
                    trace!("Stored entry {} not usable: {}", entry.key, reason);
                    continue;
                }
            }
        }
        None
    }

    /// 条件付きリクエストで検証し、304なら保存レスポンスを返す
    ///
    /// 304以外はその場でクライアントへ書き込み、保存処理に回します。
    /// オリジンに到達できない場合は保存レスポンスを `fwd=stale` で返します。
    async fn validate_and_serve(
        self: &Arc<Self>,
        req: &Request,
        validation_req: Request,
        entry: &CacheEntry,
        timed: TimedResponse,
        stream: &mut TcpStream,
        client_keep_alive: bool,
    ) -> bool {
        let mut cs = CacheStatus::new();
        cs.forward(FwdReason::Stale);

        // 304はクライアントへ流さない（抑止して保存レスポンスで応える）
        let mut capture = ResponseCapture::new(Some(&mut *stream), Some(304));
        let requested_at = capture.created_at;

        let mut vres = match client::fetch(&self.origin, &validation_req).await {
            Ok(res) => res,
            Err(e) => {
                // 検証失敗はトランスポートエラーを出さず、保存レスポンスで応える
                warn!("Validation request failed, serving stored response: {}", e);
                drop(capture);
                let now = OffsetDateTime::now_utc();
                let mut cs = CacheStatus::new();
                cs.forward(FwdReason::Stale)
                    .ttl((entry.expires - now).whole_seconds());
                let res = hit_response(
                    &timed.response,
                    timed.response_time,
                    timed.request_time,
                    now,
                );
                return self
                    .write_response(stream, req, res, &cs, client_keep_alive)
                    .await;
            }
        };
        let received_at = OffsetDateTime::now_utc();
        self.prepare_origin_response(req, &mut vres);

        // 304以外の新しいレスポンスは、保存されるならstoredとttlを報告する
        if vres.status != 304 {
            if let Some(expires) = storable_expiry(req, &vres, received_at) {
                cs.stored(true).ttl((expires - received_at).whole_seconds());
            }
        }
        capture
            .client_header("Cache-Status", cs.field_value())
            .client_header(
                "Connection",
                if client_keep_alive { "keep-alive" } else { "close" },
            );

        let write_ok = capture.send(&vres).await.is_ok();
        let suppressed = capture.suppressed();
        drop(capture);

        if suppressed {
            // 検証成功: 保存済みヘッダーを§3.2に従い更新して再保存
            let mut merged = timed.response.clone();
            update_stored_headers(&mut merged, &vres);
            let refreshed = TimedResponse {
                response: merged.clone(),
                request: Some(req.clone()),
                request_time: requested_at,
                response_time: received_at,
            };
            self.store_timed(req, &refreshed);

            let now = OffsetDateTime::now_utc();
            let mut cs = CacheStatus::new();
            cs.hit()
                .ttl((expires_at(&merged, received_at) - now).whole_seconds());
            let res = hit_response(&merged, received_at, requested_at, now);
            return self
                .write_response(stream, req, res, &cs, client_keep_alive)
                .await;
        }

        // 新しいレスポンスはクライアントへ書き込み済み。保存処理に回す
        self.log_request(req, &cs, vres.status);
        self.finish_response(req.clone(), vres, requested_at, received_at)
            .await;
        write_ok && client_keep_alive
    }

    // ====================
    // ミス時のオリジン転送
    // ====================

    /// オリジンへ転送してレスポンスを書き込み、保存処理に回す
    async fn forward_miss(
        self: &Arc<Self>,
        req: &Request,
        stream: &mut TcpStream,
        client_keep_alive: bool,
    ) -> bool {
        trace!("proxying {}", req.target);
        let mut cs = CacheStatus::new();
        cs.forward(FwdReason::UriMiss);

        // キャプチャの生成時刻が保存エントリのrequested_atになる
        let mut capture = ResponseCapture::new(Some(&mut *stream), None);
        let requested_at = capture.created_at;

        let mut res = match client::fetch(&self.origin, req).await {
            Ok(res) => res,
            Err(e) => {
                error!("Origin fetch error for {}: {}", req.target, e);
                drop(capture);
                let _ = write_error(stream, 502).await;
                return false;
            }
        };
        let received_at = OffsetDateTime::now_utc();
        self.prepare_origin_response(req, &mut res);

        // 転送と同時に保存されるレスポンスはstoredとttlを報告する
        if let Some(expires) = storable_expiry(req, &res, received_at) {
            cs.stored(true).ttl((expires - received_at).whole_seconds());
        }
        capture
            .client_header("Cache-Status", cs.field_value())
            .client_header(
                "Connection",
                if client_keep_alive { "keep-alive" } else { "close" },
            );

        // リダイレクトは応答を書く前に保存・更新を完了させる。後続の
        // リクエストはリダイレクト先に当たる可能性が高く、競走に負けると
        // キャッシュの意味がなくなるため
        let redirect = (300..400).contains(&res.status);
        if redirect {
            self.finish_response(req.clone(), res.clone(), requested_at, received_at)
                .await;
        }

        let write_ok = capture.send(&res).await.is_ok();
        let status = capture.status();
        drop(capture);
        self.log_request(req, &cs, status);

        if !redirect {
            let cache = self.clone();
            let req = req.clone();
            monoio::spawn(async move {
                cache.finish_response(req, res, requested_at, received_at).await;
            });
        }

        write_ok && client_keep_alive
    }

    /// 応答後の保存・無効化・Cache-Update処理
    pub(crate) async fn finish_response(
        self: &Arc<Self>,
        req: Request,
        res: Response,
        requested_at: OffsetDateTime,
        received_at: OffsetDateTime,
    ) {
        let timed = TimedResponse {
            response: res.clone(),
            request: Some(req.clone()),
            request_time: requested_at,
            response_time: received_at,
        };
        self.store_timed(&req, &timed);
        self.update_if_needed(&req, &res).await;
    }

    // ====================
    // 保存
    // ====================

    /// 保存可能であればストアへ書き込む
    ///
    /// 書き込んだ場合にtrueを返します。
    pub(crate) fn store_timed(&self, req: &Request, timed: &TimedResponse) -> bool {
        let Some(expires) = storable_expiry(req, &timed.response, timed.response_time) else {
            trace!("Response not storable: {} {}", req.method, req.target);
            return false;
        };

        let prefix = self.keyer.key_prefix(req);
        let key = self.keyer.add_vary(&prefix, req, &timed.response);
        let bytes = serializer::to_bytes(timed);
        trace!("Writing to cache: {} (expires {})", key, expires);
        match self.store.put(CacheEntry {
            key,
            expires,
            requested_at: timed.request_time,
            received_at: timed.response_time,
            bytes,
        }) {
            Ok(()) => true,
            Err(e) => {
                error!("Could not write to cache: {}", e);
                false
            }
        }
    }

    /// オリジンからGETして保存する（リフレッシュ・更新系の共通処理）
    ///
    /// 戻り値は `(保存したか, トランスポート成功か)`。
    pub(crate) async fn save_request(&self, req: &Request) -> (bool, bool) {
        debug!(
            "Requesting content from origin: {} {}",
            req.method, req.target
        );
        // 下流なしのキャプチャで記録のみ行う
        let mut capture: ResponseCapture<'_, Vec<u8>> = ResponseCapture::new(None, None);
        let requested_at = capture.created_at;
        let mut res = match client::fetch(&self.origin, req).await {
            Ok(res) => res,
            Err(e) => {
                warn!("Could not fetch {} from origin: {}", req.target, e);
                return (false, false);
            }
        };
        let received_at = OffsetDateTime::now_utc();
        self.prepare_origin_response(req, &mut res);
        if capture.send(&res).await.is_err() {
            return (false, false);
        }

        let timed = TimedResponse {
            response: res,
            request: Some(req.clone()),
            request_time: requested_at,
            response_time: received_at,
        };
        (self.store_timed(req, &timed), true)
    }

    // ====================
    // 無効化とCache-Update
    // ====================

    /// 安全でないレスポンスに伴う無効化・更新処理（§4.4 + Cache-Update）
    pub(crate) async fn update_if_needed(self: &Arc<Self>, req: &Request, res: &Response) {
        let uris = invalidate_uris(req, res);
        if self.update_timeout.is_none() {
            self.invalidate_uris(&uris);
        } else {
            self.revalidate_uris(&uris).await;
        }

        for update in cache_updates(req, res) {
            trace!("Updating cache based on header: {}", update.path);
            let get_req = Request::new("GET", update.path.clone());
            if update.delay.is_zero() {
                self.apply_update(&get_req).await;
            } else {
                let cache = self.clone();
                let delay = update.delay;
                monoio::spawn(async move {
                    monoio::time::sleep(delay).await;
                    cache.apply_update(&get_req).await;
                });
            }
        }
    }

    /// Cache-Update 1件の適用（結果はキャッシュへupsert）
    async fn apply_update(&self, req: &Request) {
        let (cached, transport_ok) = self.save_request(req).await;
        if !transport_ok {
            warn!("Could not save update for {}", req.target);
        } else if !cached {
            trace!("Update for {} was not storable", req.target);
        }
    }

    /// レガシーモード: 一致する保存エントリをすべてパージ
    fn invalidate_uris(&self, uris: &[String]) {
        for uri in uris {
            trace!("Invalidating stored response: {}", uri);
            let prefix = self.keyer.key_prefix(&Request::new("GET", uri.clone()));
            self.purge_prefix(&prefix);
        }
    }

    /// アクティブモード: 存在するエントリを再取得で置き換え、失敗ならパージ
    async fn revalidate_uris(&self, uris: &[String]) {
        for uri in uris {
            trace!("Revalidating possibly stored response: {}", uri);
            let get_req = Request::new("GET", uri.clone());
            let prefix = self.keyer.key_prefix(&get_req);
            if !self.store.has(&prefix) {
                continue;
            }
            let (cached, _) = self.save_request(&get_req).await;
            if !cached {
                self.purge_prefix(&prefix);
            }
        }
    }

    /// プレフィックスに一致する全キーをパージ
    pub(crate) fn purge_prefix(&self, prefix: &str) {
        let mut keys = Vec::new();
        self.store.all_keys(prefix, &mut |key| keys.push(key.to_string()));
        for key in keys {
            self.store.purge(&key);
        }
    }

    // ====================
    // レスポンス整形
    // ====================

    /// オリジンレスポンスの到着時処理
    ///
    /// Dateの補完（以降の鮮度計算の前提）、エコーされたX-Forwarded-*の
    /// 除去、書き換えルールとレスポンス修飾フックの適用を行います。
    fn prepare_origin_response(&self, req: &Request, res: &mut Response) {
        if res.headers.get("date").is_none() {
            res.headers
                .set("Date", format_http_date(OffsetDateTime::now_utc()));
        }
        // 接続単位のヘッダーは保存にも転送にも含めない
        strip_hop_by_hop(&mut res.headers);
        strip_forwarded(&mut res.headers);
        // ボディはバッファ済みのため、保存形式と転送形式は
        // Content-Lengthフレーミングに揃える
        if !req.method.eq_ignore_ascii_case("HEAD") {
            res.headers
                .set("Content-Length", res.body.len().to_string());
        }
        self.rules.apply(req, res);
        if let Some(modifier) = &self.response_modifier {
            modifier(req, res);
        }
    }

    /// レスポンスをクライアントへ書き込む
    ///
    /// Cache-Statusを必ず付与し、Content-Lengthフレーミングで送出します。
    async fn write_response(
        &self,
        stream: &mut TcpStream,
        req: &Request,
        mut res: Response,
        cs: &CacheStatus,
        client_keep_alive: bool,
    ) -> bool {
        strip_hop_by_hop(&mut res.headers);
        strip_forwarded(&mut res.headers);
        let body_allowed =
            !req.method.eq_ignore_ascii_case("HEAD") && res.status != 204 && res.status != 304;
        if body_allowed {
            res.headers
                .set("Content-Length", res.body.len().to_string());
        } else {
            res.body.clear();
        }
        res.headers.set("Cache-Status", cs.field_value());
        res.headers.set(
            "Connection",
            if client_keep_alive { "keep-alive" } else { "close" },
        );

        self.log_request(req, cs, res.status);
        let wire = res.to_wire();
        let write_result = timeout(WRITE_TIMEOUT, stream.write_buf(wire)).await;
        matches!(write_result, Ok((Ok(_), _))) && client_keep_alive
    }

    fn log_request(&self, req: &Request, cs: &CacheStatus, status: u16) {
        debug!(
            "{} {} -> {} [{}]",
            req.method,
            req.target,
            status,
            cs.field_value()
        );
    }
}

/// 保存可否と有効期限を先に判定する
///
/// ストアへの書き込みと、Cache-Statusの `stored` / `ttl` 報告が
/// 同じ判定を共有します。保存されない場合は `None`。
fn storable_expiry(
    req: &Request,
    res: &Response,
    received_at: OffsetDateTime,
) -> Option<OffsetDateTime> {
    if must_not_store(req, res) {
        return None;
    }
    let expires = expires_at(res, received_at);
    if expires == crate::http::zero_instant() {
        return None;
    }
    Some(expires)
}

// ====================
// クライアントリクエストのパース
// ====================

/// 蓄積バッファから1リクエストを切り出す
///
/// 戻り値は `(リクエスト, 消費バイト数, Keep-Aliveを継続するか)`。
/// データ不足は `Ok(None)`、エラーは応答すべきステータスコード。
fn parse_client_request(buf: &[u8]) -> Result<Option<(Request, usize, bool)>, u16> {
    let mut storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut storage);
    let header_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(413);
            }
            return Ok(None);
        }
        Err(_) => return Err(400),
    };
    if header_len > MAX_HEADER_SIZE {
        return Err(413);
    }

    let method = parsed.method.ok_or(400u16)?.to_string();
    let target = parsed.path.ok_or(400u16)?.to_string();
    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for h in parsed.headers.iter() {
        let value = std::str::from_utf8(h.value).map_err(|_| 400u16)?;
        headers.append(h.name, value);
    }

    let keep_alive = !headers
        .get("connection")
        .map(|v| v.trim().eq_ignore_ascii_case("close"))
        .unwrap_or(false);

    let rest = &buf[header_len..];
    let (body, consumed) = if is_chunked(&headers) {
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();
        let (done, used) = decoder.decode(rest, &mut body);
        if !done {
            if body.len() > MAX_BODY_SIZE {
                return Err(413);
            }
            return Ok(None);
        }
        if body.len() > MAX_BODY_SIZE {
            return Err(413);
        }
        (body, header_len + used)
    } else {
        let length = content_length(&headers).unwrap_or(0);
        if length > MAX_BODY_SIZE {
            return Err(413);
        }
        if rest.len() < length {
            return Ok(None);
        }
        (rest[..length].to_vec(), header_len + length)
    };

    let req = Request {
        method,
        target,
        headers,
        body,
    };
    Ok(Some((req, consumed, keep_alive)))
}

/// エラー応答を書き込む
async fn write_error(stream: &mut TcpStream, status: u16) -> io::Result<()> {
    let mut cs = CacheStatus::new();
    cs.forward(FwdReason::UriMiss);
    let mut res = Response::new(status);
    res.headers.set("Content-Length", "0");
    res.headers.set("Cache-Status", cs.field_value());
    res.headers.set("Connection", "close");
    let (result, _buf) = timeout(WRITE_TIMEOUT, stream.write_buf(res.to_wire()))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timeout"))?;
    result?;
    Ok(())
}
