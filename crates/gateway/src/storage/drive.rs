//! # Google Drive 再開可能アップロード
//!
//! Drive API v3 の resumable upload プロトコルで一時ファイルを転送する。
//!
//! ## プロトコル
//! 1. `POST /upload/drive/v3/files?uploadType=resumable` にメタデータを送り、
//!    `Location` ヘッダでセッションURIを受け取る
//! 2. セッションURIに `Content-Range: bytes a-b/total` 付きでチャンクを `PUT` する
//!    - `308` + `Range: bytes=0-n`: 続きは `n+1` から
//!    - `200` / `201`: 完了（`id`, `webViewLink` を含む）
//! 3. ネットワークエラー・タイムアウト・`429`・`5xx` の場合はバックオフ後に
//!    `Content-Range: bytes */total` でセッション状態を問い合わせ、
//!    プロバイダが受け取り済みのオフセットから再開する
//! 4. `401` の場合はアクセストークンを1度だけ更新して同じオフセットから続行する
//!
//! それ以外のステータスは回復不能として `RemoteTransfer` を返す。

use std::io::SeekFrom;
use std::time::Duration;

use reqwest::header::{HeaderMap, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{RemoteStorage, TokenSource, UploadSource, UploadedObject};
use crate::error::RelayError;

/// チャンクサイズの単位。最終チャンク以外はこの倍数でなければならない。
pub const CHUNK_GRANULARITY: usize = 256 * 1024;

/// デフォルトのチャンクサイズ（8 MiB）。
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// 最初の再送までの待ち時間。以降は倍々に伸ばす。
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// チャンクサイズを `CHUNK_GRANULARITY` の倍数に切り下げる（最小1単位）。
pub fn normalize_chunk_size(size: usize) -> usize {
    (size / CHUNK_GRANULARITY).max(1) * CHUNK_GRANULARITY
}

/// 完了時にDriveが返すファイルリソース（`fields=id,webViewLink`）。
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    web_view_link: Option<String>,
}

/// 1回のリクエストの結果。
enum Attempt {
    /// 転送完了
    Done(UploadedObject),
    /// 未完了。次に送るべきオフセット
    Continue(u64),
    /// 一時的な失敗。再送可能
    Retry(String),
    /// アクセストークンが拒否された
    Unauthorized(String),
}

/// セッション開始の結果。
enum SessionStart {
    /// セッションURI
    Started(String),
    /// アクセストークンが拒否された
    Unauthorized(String),
}

/// Google Drive によるリモートストレージ実装。
pub struct DriveStorage {
    http_client: reqwest::Client,
    /// APIのベースURL（例: "https://www.googleapis.com"）
    api_base: String,
    /// 保存先フォルダID
    folder_id: String,
    chunk_size: usize,
    max_retries: u32,
    retry_delay: Duration,
}

impl DriveStorage {
    /// 新しいDriveStorageを作成する。
    ///
    /// `308 Resume Incomplete` をプロトコル側で扱うため、リダイレクトは無効にする。
    /// `request_timeout` は1リクエスト（1チャンク）ごとの上限で、超過は一時的な失敗として再送する。
    pub fn new(
        api_base: &str,
        folder_id: &str,
        chunk_size: usize,
        max_retries: u32,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(30))
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            http_client,
            api_base: api_base.trim_end_matches('/').to_string(),
            folder_id: folder_id.to_string(),
            chunk_size: normalize_chunk_size(chunk_size),
            max_retries,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// 再送前の初回待ち時間を変更する。
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// 再開可能アップロードのセッションを開始し、セッションURIを返す。
    async fn start_session(
        &self,
        access_token: &str,
        source: &UploadSource<'_>,
        total: u64,
    ) -> Result<SessionStart, RelayError> {
        let url = format!("{}/upload/drive/v3/files", self.api_base);
        let metadata = serde_json::json!({
            "name": source.filename,
            "parents": [self.folder_id],
        });

        let response = self
            .http_client
            .post(&url)
            .query(&[
                ("uploadType", "resumable"),
                ("supportsAllDrives", "true"),
                ("fields", "id,webViewLink"),
            ])
            .bearer_auth(access_token)
            .header("X-Upload-Content-Type", source.content_type)
            .header("X-Upload-Content-Length", total.to_string())
            .json(&metadata)
            .send()
            .await
            .map_err(|e| {
                RelayError::RemoteTransfer(format!("no se pudo iniciar la sesión de subida: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = format!("HTTP {status}: {body}");
            if status == StatusCode::UNAUTHORIZED {
                return Ok(SessionStart::Unauthorized(reason));
            }
            return Err(RelayError::RemoteTransfer(reason));
        }

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|uri| SessionStart::Started(uri.to_string()))
            .ok_or_else(|| {
                RelayError::RemoteTransfer("la respuesta no incluye la URI de sesión".to_string())
            })
    }

    /// セッションを開始する。401なら1度だけトークンを更新してやり直す。
    async fn open_session(
        &self,
        token: &mut String,
        tokens: &dyn TokenSource,
        source: &UploadSource<'_>,
        total: u64,
    ) -> Result<String, RelayError> {
        let reason = match self.start_session(token.as_str(), source, total).await? {
            SessionStart::Started(uri) => return Ok(uri),
            SessionStart::Unauthorized(reason) => reason,
        };

        tracing::warn!(reason = %reason, "セッション開始でトークンが拒否されました: 更新します");
        *token = tokens.renew(token.as_str()).await?;

        match self.start_session(token.as_str(), source, total).await? {
            SessionStart::Started(uri) => Ok(uri),
            SessionStart::Unauthorized(reason) => Err(RelayError::RemoteTransfer(reason)),
        }
    }

    /// `offset` から1チャンク分を送る。
    async fn send_chunk(
        &self,
        session_uri: &str,
        access_token: &str,
        file: &mut tokio::fs::File,
        offset: u64,
        total: u64,
    ) -> Result<Attempt, RelayError> {
        let end = (offset + self.chunk_size as u64).min(total);
        let mut buf = vec![0u8; (end - offset) as usize];

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| RelayError::Internal(format!("一時ファイルのシークに失敗: {e}")))?;
        file.read_exact(&mut buf)
            .await
            .map_err(|e| RelayError::Internal(format!("一時ファイルの読み込みに失敗: {e}")))?;

        let content_range = if total == 0 {
            "bytes */0".to_string()
        } else {
            format!("bytes {offset}-{}/{total}", end - 1)
        };

        let result = self
            .http_client
            .put(session_uri)
            .bearer_auth(access_token)
            .header(CONTENT_RANGE, content_range)
            .body(buf)
            .send()
            .await;

        match result {
            Ok(response) => interpret(response).await,
            Err(e) => Ok(Attempt::Retry(network_reason(&e))),
        }
    }

    /// プロバイダが受け取り済みのバイト数を問い合わせる。
    async fn query_status(
        &self,
        session_uri: &str,
        access_token: &str,
        total: u64,
    ) -> Result<Attempt, RelayError> {
        let result = self
            .http_client
            .put(session_uri)
            .bearer_auth(access_token)
            .header(CONTENT_RANGE, format!("bytes */{total}"))
            .body(Vec::new())
            .send()
            .await;

        match result {
            Ok(response) => interpret(response).await,
            Err(e) => Ok(Attempt::Retry(network_reason(&e))),
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        self.retry_delay
            .saturating_mul(1u32 << failures.saturating_sub(1).min(16))
    }
}

#[async_trait::async_trait]
impl RemoteStorage for DriveStorage {
    async fn upload(
        &self,
        access_token: &str,
        tokens: &dyn TokenSource,
        source: UploadSource<'_>,
    ) -> Result<UploadedObject, RelayError> {
        let total = tokio::fs::metadata(source.path)
            .await
            .map_err(|e| RelayError::Internal(format!("一時ファイルの情報取得に失敗: {e}")))?
            .len();
        let mut file = tokio::fs::File::open(source.path)
            .await
            .map_err(|e| RelayError::Internal(format!("一時ファイルを開けません: {e}")))?;

        let mut token = access_token.to_string();
        let session_uri = self
            .open_session(&mut token, tokens, &source, total)
            .await?;
        tracing::debug!(filename = %source.filename, total, "再開可能アップロードを開始");

        let mut offset: u64 = 0;
        let mut failures: u32 = 0;
        // 前回の前進以降にトークンを更新したか
        let mut renewed = false;

        loop {
            let reason = match self
                .send_chunk(&session_uri, &token, &mut file, offset, total)
                .await?
            {
                Attempt::Done(object) => {
                    tracing::info!(file_id = %object.id, bytes = total, "Driveへのアップロード完了");
                    return Ok(object);
                }
                Attempt::Continue(next) if next > offset && next <= total => {
                    offset = next;
                    failures = 0;
                    renewed = false;
                    continue;
                }
                Attempt::Continue(next) => {
                    format!("el proveedor no confirmó avance (offset {offset}, informado {next})")
                }
                Attempt::Retry(reason) => reason,
                Attempt::Unauthorized(reason) if renewed => {
                    return Err(RelayError::RemoteTransfer(reason));
                }
                Attempt::Unauthorized(reason) => {
                    tracing::warn!(offset, reason = %reason, "トークンが拒否されました: 更新して続行します");
                    token = tokens.renew(&token).await?;
                    renewed = true;
                    continue;
                }
            };

            failures += 1;
            if failures > self.max_retries {
                return Err(RelayError::RemoteTransfer(format!(
                    "transferencia interrumpida tras {} reintentos: {reason}",
                    self.max_retries
                )));
            }

            let delay = self.backoff(failures);
            tracing::warn!(
                offset,
                total,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "チャンク送信に失敗: 再開します"
            );
            tokio::time::sleep(delay).await;

            match self.query_status(&session_uri, &token, total).await? {
                Attempt::Done(object) => return Ok(object),
                Attempt::Continue(next) if next <= total => offset = next,
                _ => {}
            }
        }
    }
}

/// レスポンスを `Attempt` に変換する。回復不能なステータスはエラーにする。
async fn interpret(response: reqwest::Response) -> Result<Attempt, RelayError> {
    let status = response.status();

    if status == StatusCode::OK || status == StatusCode::CREATED {
        let file: DriveFile = response.json().await.map_err(|e| {
            RelayError::RemoteTransfer(format!("respuesta de Drive inválida: {e}"))
        })?;
        let id = file.id.filter(|id| !id.is_empty()).ok_or_else(|| {
            RelayError::RemoteTransfer("la respuesta de Drive no incluye id".to_string())
        })?;
        return Ok(Attempt::Done(UploadedObject {
            id,
            web_view_link: file.web_view_link,
        }));
    }

    // 308 Resume Incomplete
    if status == StatusCode::PERMANENT_REDIRECT {
        return Ok(Attempt::Continue(next_offset(response.headers())));
    }

    let body = response.text().await.unwrap_or_default();
    let reason = format!("HTTP {status}: {body}");
    if status == StatusCode::UNAUTHORIZED {
        return Ok(Attempt::Unauthorized(reason));
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Ok(Attempt::Retry(reason));
    }
    Err(RelayError::RemoteTransfer(reason))
}

/// 送信失敗の理由。タイムアウトは区別して記録する。
fn network_reason(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("tiempo de espera agotado: {e}")
    } else {
        format!("error de red: {e}")
    }
}

/// `Range: bytes=0-n` から次のオフセット `n+1` を求める。ヘッダが無ければ0。
fn next_offset(headers: &HeaderMap) -> u64 {
    headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(_, end)| end.trim().parse::<u64>().ok())
        .map(|end| end + 1)
        .unwrap_or(0)
}
