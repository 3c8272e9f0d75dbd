//! # Gateway エラー型
//!
//! アップロードパイプライン全体で共通のエラー型。
//! 呼び出し側に返すメッセージはフロントエンドの表示言語（スペイン語）に合わせる。

use axum::http::StatusCode;
use axum::Json;
use drive_relay_types::ErrorResponse;

/// Gatewayエラー型。
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// 受理可能なフィールド名のいずれにもファイルが無い
    #[error("No se envió ningún archivo")]
    NoFileProvided,
    /// サニタイズ後のファイル名が空
    #[error("Nombre de archivo vacío")]
    EmptyFilename,
    /// 拡張子が無い、または許可リストに無い
    #[error("Extensión de archivo no permitida")]
    DisallowedExtension,
    /// multipartボディの解析に失敗
    #[error("Solicitud inválida: {0}")]
    MalformedRequest(String),
    /// アップロードサイズ上限超過
    #[error("El archivo excede el tamaño máximo permitido ({limit} bytes)")]
    PayloadTooLarge {
        /// 設定上の上限（バイト）
        limit: u64,
    },
    /// クライアントシークレット記述子が存在しない
    #[error("Falta credentials.json en {0}")]
    MissingCredentialFile(String),
    /// トークンレコードが存在しない
    #[error(
        "Falta token.json en {0}. Genéralo fuera del contenedor con access_type=offline y móntalo."
    )]
    MissingTokenFile(String),
    /// 認証情報ファイルの形式が不正
    #[error("Formato de credenciales inválido: {0}")]
    CredentialFormat(String),
    /// トークンが無効で、リフレッシュもできない
    #[error(
        "token.json inválido o sin refresh_token ({0}). \
         Regenéralo fuera del contenedor con access_type=offline."
    )]
    CredentialUnrefreshable(String),
    /// リモートプロバイダがリクエストを拒否した、または転送が回復不能に中断した
    #[error("Error de Google Drive: {0}")]
    RemoteTransfer(String),
    /// その他の想定外の失敗。詳細はログにのみ出力する。
    #[error("Fallo interno: {0}")]
    Internal(String),
}

impl RelayError {
    /// このエラーに対応するHTTPステータス。
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::NoFileProvided
            | RelayError::EmptyFilename
            | RelayError::DisallowedExtension
            | RelayError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::MissingCredentialFile(_)
            | RelayError::MissingTokenFile(_)
            | RelayError::CredentialFormat(_)
            | RelayError::CredentialUnrefreshable(_)
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::RemoteTransfer(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl axum::response::IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let message = match &self {
            RelayError::Internal(detail) => {
                tracing::error!(error = %detail, "アップロード処理中の内部エラー");
                "Fallo interno del servidor".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
