//! # Drive Relay 共有型定義
//!
//! アップロードリレーのHTTP APIで送受信されるJSON構造をRust構造体として提供する。
//! フロントエンド向けのフィールド名（`file_id`, `drive_url` 等）は既存クライアントとの
//! 互換性のため変更しないこと。

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// ヘルスチェックのレスポンス。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// 常に "ok"
    pub status: String,
}

impl HealthResponse {
    /// 正常応答を構築する。
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// POST /upload
// ---------------------------------------------------------------------------

/// アップロード成功時のレスポンス。
///
/// 転送が完了した場合にのみ構築される。`drive_url` はプロバイダが
/// 閲覧リンクを返さなかった場合に `null` としてシリアライズされる。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// 人間向けのステータスメッセージ
    pub message: String,
    /// リモートオブジェクトID
    pub file_id: String,
    /// 閲覧用リンク（存在する場合）
    pub drive_url: Option<String>,
}

/// エラーレスポンス。全てのエラーステータスで共通。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// エラーメッセージ
    pub error: String,
}
