//! # テスト用ヘルパー
//!
//! モックのトークンエンドポイントとモックのDrive APIサーバー、
//! 認証情報ファイルの生成を提供する。

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_RANGE, LOCATION, RANGE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Json, Router};
use chrono::{DateTime, Utc};

use crate::credentials::CredentialRecord;

/// ルーターを `127.0.0.1` の空きポートで起動し、ポート番号を返す。
pub async fn serve(router: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    port
}

/// テスト用のトークンレコード（client_id "cid" / client_secret "csecret"）。
pub fn token_record(
    token: &str,
    refresh_token: Option<&str>,
    expiry: DateTime<Utc>,
    token_uri: &str,
) -> CredentialRecord {
    CredentialRecord {
        token: Some(token.to_string()),
        refresh_token: refresh_token.map(str::to_string),
        token_uri: Some(token_uri.to_string()),
        client_id: Some("cid".to_string()),
        client_secret: Some("csecret".to_string()),
        scopes: vec!["https://www.googleapis.com/auth/drive.file".to_string()],
        expiry: Some(expiry),
        extra: serde_json::Map::new(),
    }
}

/// `dir` に `credentials.json` と `token.json` を書き出す。
pub fn write_credentials(dir: &Path, record: &CredentialRecord) {
    std::fs::write(
        dir.join("credentials.json"),
        r#"{"installed": {"client_id": "cid", "client_secret": "csecret"}}"#,
    )
    .unwrap();
    std::fs::write(dir.join("token.json"), serde_json::to_vec(record).unwrap()).unwrap();
}

// ---------------------------------------------------------------------------
// モックトークンエンドポイント
// ---------------------------------------------------------------------------

/// モックのOAuth2トークンエンドポイント。
pub struct MockTokenServer {
    /// エンドポイントURL（`/token` で終わる）
    pub url: String,
    /// 受けたリクエスト数
    pub calls: Arc<AtomicUsize>,
    /// 受けたフォームパラメータ
    pub forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl MockTokenServer {
    /// 常に新しいアクセストークンを返すサーバーを起動する。
    pub async fn start_ok(access_token: &str, expires_in: i64) -> Self {
        Self::start(
            StatusCode::OK,
            serde_json::json!({
                "access_token": access_token,
                "expires_in": expires_in,
                "token_type": "Bearer",
            }),
        )
        .await
    }

    /// 固定のステータスとボディを返すサーバーを起動する。
    pub async fn start(status: StatusCode, body: serde_json::Value) -> Self {
        Self::spawn(status, body, std::time::Duration::ZERO).await
    }

    /// リクエストを受け付けるが応答しないサーバーを起動する。
    pub async fn start_stalled() -> Self {
        Self::spawn(StatusCode::OK, serde_json::json!({}), HANG_DURATION).await
    }

    async fn spawn(
        status: StatusCode,
        body: serde_json::Value,
        delay: std::time::Duration,
    ) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let forms = Arc::new(Mutex::new(Vec::new()));

        let router = {
            let calls = calls.clone();
            let forms = forms.clone();
            Router::new().route(
                "/token",
                post(move |Form(form): Form<HashMap<String, String>>| {
                    let calls = calls.clone();
                    let forms = forms.clone();
                    let body = body.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        forms.lock().unwrap().push(form);
                        tokio::time::sleep(delay).await;
                        (status, Json(body))
                    }
                }),
            )
        };

        let port = serve(router).await;
        Self {
            url: format!("http://127.0.0.1:{port}/token"),
            calls,
            forms,
        }
    }
}

// ---------------------------------------------------------------------------
// モックDrive API
// ---------------------------------------------------------------------------

/// モックDriveの挙動設定。
#[derive(Debug, Clone, Default)]
pub struct MockDriveOptions {
    /// セッション開始を拒否するステータス
    pub reject_init: Option<StatusCode>,
    /// すべてのチャンクを拒否するステータス
    pub reject_chunks: Option<StatusCode>,
    /// 先頭からこの回数のチャンクPUTに503を返す
    pub fail_chunks: usize,
    /// 503を返す前にチャンクを受信済みにするか
    pub store_before_fail: bool,
    /// 完了レスポンスから webViewLink を省く
    pub omit_link: bool,
    /// 先頭からこの回数のチャンクPUTに応答しない
    pub hang_chunks: usize,
    /// この回数のチャンクPUT以降、初期トークン `access-token` を401で拒否する
    /// （`Some(0)` はセッション開始も拒否）
    pub expire_token_after: Option<usize>,
}

/// 初期トークンの `Authorization` ヘッダ値。
const INITIAL_AUTHORIZATION: &str = "Bearer access-token";

/// 応答しないリクエストの待ち時間。クライアントのタイムアウトより十分長くする。
const HANG_DURATION: std::time::Duration = std::time::Duration::from_secs(30);

/// セッション開始リクエストの記録。
#[derive(Debug, Clone)]
pub struct InitRecord {
    /// クエリパラメータ
    pub query: HashMap<String, String>,
    /// `Authorization` ヘッダ
    pub authorization: Option<String>,
    /// `X-Upload-Content-Type` ヘッダ
    pub upload_content_type: Option<String>,
    /// JSONメタデータ（name, parents）
    pub metadata: serde_json::Value,
}

/// モックDriveの状態。
pub struct MockDriveState {
    options: MockDriveOptions,
    session_uri: String,
    /// 受信済みバイト列
    pub received: Mutex<Vec<u8>>,
    /// 最後のセッション開始リクエスト
    pub init: Mutex<Option<InitRecord>>,
    /// セッション開始リクエストの回数
    pub inits: AtomicUsize,
    /// チャンクPUTの回数（状態問い合わせを除く）
    pub chunk_puts: AtomicUsize,
    /// 状態問い合わせの回数
    pub status_queries: AtomicUsize,
    remaining_failures: AtomicUsize,
    remaining_hangs: AtomicUsize,
}

impl MockDriveState {
    /// 期限切れの初期トークンで送られたリクエストか。`puts` はそれまでのチャンクPUT数。
    fn token_expired(&self, headers: &HeaderMap, puts: usize) -> bool {
        self.options
            .expire_token_after
            .is_some_and(|after| puts >= after)
            && header_string(headers, AUTHORIZATION.as_str()).as_deref()
                == Some(INITIAL_AUTHORIZATION)
    }
}

/// モックのDrive API（resumable upload のみ）。
pub struct MockDrive {
    /// APIベースURL
    pub base_url: String,
    /// 受信内容とリクエスト数
    pub state: Arc<MockDriveState>,
}

impl MockDrive {
    /// モックDriveを起動する。
    pub async fn start(options: MockDriveOptions) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let base_url = format!("http://127.0.0.1:{port}");

        let state = Arc::new(MockDriveState {
            remaining_failures: AtomicUsize::new(options.fail_chunks),
            remaining_hangs: AtomicUsize::new(options.hang_chunks),
            options,
            session_uri: format!(
                "{base_url}/upload/drive/v3/files?uploadType=resumable&upload_id=session-1"
            ),
            received: Mutex::new(Vec::new()),
            init: Mutex::new(None),
            inits: AtomicUsize::new(0),
            chunk_puts: AtomicUsize::new(0),
            status_queries: AtomicUsize::new(0),
        });

        let router = Router::new()
            .route(
                "/upload/drive/v3/files",
                post(start_session).put(put_chunk),
            )
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        Self { base_url, state }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn start_session(
    State(state): State<Arc<MockDriveState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(metadata): Json<serde_json::Value>,
) -> Response {
    *state.init.lock().unwrap() = Some(InitRecord {
        query,
        authorization: header_string(&headers, AUTHORIZATION.as_str()),
        upload_content_type: header_string(&headers, "x-upload-content-type"),
        metadata,
    });
    state.inits.fetch_add(1, Ordering::SeqCst);

    if state.token_expired(&headers, 0) {
        return unauthorized();
    }

    if let Some(status) = state.options.reject_init {
        let body = serde_json::json!({
            "error": {"code": status.as_u16(), "message": "insufficientPermissions"}
        });
        return (status, Json(body)).into_response();
    }

    (StatusCode::OK, [(LOCATION, state.session_uri.clone())]).into_response()
}

async fn put_chunk(
    State(state): State<Arc<MockDriveState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_range = header_string(&headers, CONTENT_RANGE.as_str()).unwrap_or_default();
    let Some((span, total)) = content_range
        .strip_prefix("bytes ")
        .and_then(|v| v.split_once('/'))
    else {
        return (StatusCode::BAD_REQUEST, "bad Content-Range").into_response();
    };
    let total: usize = total.parse().unwrap();

    if span == "*" && total > 0 {
        state.status_queries.fetch_add(1, Ordering::SeqCst);
        if state.token_expired(&headers, state.chunk_puts.load(Ordering::SeqCst)) {
            return unauthorized();
        }
        return progress(&state, total);
    }

    let puts = state.chunk_puts.fetch_add(1, Ordering::SeqCst);

    if state.token_expired(&headers, puts) {
        return unauthorized();
    }

    let hanging = state
        .remaining_hangs
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if hanging {
        tokio::time::sleep(HANG_DURATION).await;
        return (StatusCode::SERVICE_UNAVAILABLE, "timeout").into_response();
    }

    if let Some(status) = state.options.reject_chunks {
        return (status, "session expired").into_response();
    }

    let start: usize = match span.split_once('-') {
        Some((start, _)) => start.parse().unwrap(),
        None => 0,
    };

    let failing = state
        .remaining_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();

    {
        let mut received = state.received.lock().unwrap();
        if start != received.len() {
            return (StatusCode::BAD_REQUEST, "offset mismatch").into_response();
        }
        if !failing || state.options.store_before_fail {
            received.extend_from_slice(&body);
        }
    }

    if failing {
        return (StatusCode::SERVICE_UNAVAILABLE, "backendError").into_response();
    }
    progress(&state, total)
}

fn unauthorized() -> Response {
    let body = serde_json::json!({
        "error": {"code": 401, "message": "Invalid Credentials"}
    });
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

/// 受信済みの量に応じて308か完了レスポンスを返す。
fn progress(state: &MockDriveState, total: usize) -> Response {
    let received = state.received.lock().unwrap().len();
    if received >= total {
        let mut file = serde_json::json!({"id": "drive-file-1"});
        if !state.options.omit_link {
            file["webViewLink"] = "https://drive.google.com/file/d/drive-file-1/view".into();
        }
        return (StatusCode::OK, Json(file)).into_response();
    }
    if received == 0 {
        return StatusCode::PERMANENT_REDIRECT.into_response();
    }
    (
        StatusCode::PERMANENT_REDIRECT,
        [(RANGE, format!("bytes=0-{}", received - 1))],
    )
        .into_response()
}
