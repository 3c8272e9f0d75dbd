//! # GET /health
//!
//! 死活監視用。依存サービスには問い合わせない。

use axum::Json;
use drive_relay_types::HealthResponse;

/// GET /health: 常に `{"status": "ok"}` を返す。
pub async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}
