//! # Drive Relay Gateway
//!
//! ブラウザのフォームから受け取ったファイルを、サービスアカウントではなく
//! 帯域外で発行済みのOAuth2ユーザー認証情報を使ってGoogle Driveの固定フォルダへ転送する。
//!
//! ## 役割
//! - ファイル名のサニタイズと拡張子の許可リスト判定
//! - 一時ファイルへの書き出しと確実な削除
//! - アクセストークンの自動リフレッシュと書き戻し
//! - Drive再開可能アップロードによる転送
//! - 許可オリジンへのCORSヘッダ付与
//!
//! ## API エンドポイント
//! - `GET /health`: 死活監視
//! - `POST /upload`: ファイル転送
//! - `OPTIONS /upload`: プリフライト

mod admission;
mod config;
mod cors;
mod credentials;
mod endpoints;
mod error;
mod storage;
mod temp_file;

#[cfg(test)]
mod test_helpers;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{GatewayState, RelayConfig};
use crate::credentials::{CredentialManager, CredentialStore};
use crate::storage::DriveStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env があれば読み込む（無くてもよい）
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();

    let config = RelayConfig::from_env()?;

    let storage = DriveStorage::new(
        &config.google_api_base,
        &config.folder_id,
        config.drive_chunk_size,
        config.drive_max_retries,
        config.drive_timeout,
    )?;

    let credentials = CredentialManager::with_timeout(
        CredentialStore::new(
            config.credentials_file.clone(),
            config.token_file.clone(),
        ),
        config.token_timeout,
    )?;

    tracing::info!(
        folder_id = %config.folder_id,
        token_file = %config.token_file.display(),
        upload_tmp_dir = %config.upload_tmp_dir.display(),
        max_upload_bytes = config.max_upload_bytes,
        allowed_origins = ?config.allowed_origins,
        "設定を読み込みました"
    );

    let addr = config.bind_addr;
    let state = Arc::new(GatewayState {
        config,
        credentials,
        storage: Box::new(storage),
    });
    let app = endpoints::router(state);

    tracing::info!("Gatewayを {} で起動します", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gatewayを停止しました");
    Ok(())
}

/// Ctrl+C または SIGTERM を待つ。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+Cハンドラを登録できません");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERMハンドラを登録できません");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+Cを受信しました"),
        _ = terminate => tracing::info!("SIGTERMを受信しました"),
    }
}
