//! # Gatewayエンドポイント
//!
//! - `GET /health`: 死活監視
//! - `POST /upload`: ファイルを受け取りDriveへ転送
//! - `OPTIONS /upload`: CORSプリフライト（204）

pub mod health;
pub mod upload;

pub use health::handle_health;
pub use upload::{handle_preflight, handle_upload};

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::GatewayState;
use crate::cors::{apply_cors, AllowedOrigins};

/// ルーターを構築する。
///
/// axumのデフォルトのボディ上限（2MB）は設定値まで引き上げる。
/// CORSミドルウェアはエラーレスポンスにもヘッダを付けるため、ハンドラの外側に置く。
pub fn router(state: Arc<GatewayState>) -> Router {
    let origins = Arc::new(AllowedOrigins::new(state.config.allowed_origins.clone()));
    let body_limit = usize::try_from(state.config.max_upload_bytes).unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(handle_health))
        .route("/upload", post(handle_upload).options(handle_preflight))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum::middleware::from_fn_with_state(origins, apply_cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
