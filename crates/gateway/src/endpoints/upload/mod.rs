//! # POST /upload
//!
//! multipartで受け取ったファイルを一時ファイルに書き出し、
//! Google Driveの保存先フォルダへ転送する。
//!
//! ## 処理の流れ
//! 1. 宣言された `Content-Length` を上限と比較
//! 2. 受理可能なフィールドのうち優先順位の最も高いファイルを選ぶ
//!    （ファイル名のサニタイズ・拡張子の検証・一時ファイルへの書き出しを含む）
//! 3. 認証情報の取得（必要ならリフレッシュ）
//! 4. リモートへの転送
//! 5. 一時ファイルの削除（成否に関わらず必ず実行）

use std::path::Path;
use std::sync::Arc;

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Multipart, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use drive_relay_types::UploadResponse;
use futures::TryStreamExt;

use crate::admission::{admit, field_priority, AdmittedFile};
use crate::config::GatewayState;
use crate::error::RelayError;
use crate::storage::{UploadSource, UploadedObject};
use crate::temp_file::TempArtifact;


/// 成功時のメッセージ。
const SUCCESS_MESSAGE: &str = "Archivo subido exitosamente";

/// POST /upload: ファイルを受け取りDriveへ転送する。
pub async fn handle_upload(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, RelayError> {
    let limit = state.config.max_upload_bytes;

    if let Some(declared) = declared_length(&headers) {
        if declared > limit {
            return Err(RelayError::PayloadTooLarge { limit });
        }
    }

    let mut multipart = multipart.map_err(|e| {
        tracing::debug!(error = %e, "multipart以外のリクエスト");
        RelayError::NoFileProvided
    })?;

    let (artifact, admitted) =
        select_file(&mut multipart, &state.config.upload_tmp_dir, limit).await?;

    let result = transfer(&state, &artifact, &admitted).await;
    artifact.release().await;

    let filename = admitted.filename.as_str();
    let object = result.inspect_err(|e| match e {
        RelayError::RemoteTransfer(detail) => {
            tracing::error!(filename, error = %detail, "Driveへの転送に失敗");
        }
        RelayError::Internal(_) => {}
        other => tracing::error!(filename, error = %other, "アップロードに失敗"),
    })?;

    tracing::info!(
        filename = %admitted.filename,
        file_id = %object.id,
        "ファイルをアップロードしました"
    );

    Ok(Json(UploadResponse {
        message: SUCCESS_MESSAGE.to_string(),
        file_id: object.id,
        drive_url: object.web_view_link,
    }))
}

/// 選択途中の候補。
enum Candidate {
    /// 受付済みで一時ファイルに書き出したもの
    Ready(TempArtifact, AdmittedFile),
    /// 受付で拒否されたもの。より優先度の高いフィールドが来なければこのエラーを返す
    Rejected(RelayError),
}

/// multipartを順に読み、`ACCEPTED_FIELDS` の優先順位で最も高いファイルを選ぶ。
///
/// ファイル名属性の無いフィールド、ファイル名が空（未選択の入力欄）のフィールドは無視する。
/// より優先度の高いフィールドが後から現れた場合は、先に書き出した一時ファイルを削除して置き換える。
/// 最優先の `file` が現れた時点で残りは読まない。
async fn select_file(
    multipart: &mut Multipart,
    root: &Path,
    limit: u64,
) -> Result<(TempArtifact, AdmittedFile), RelayError> {
    let mut best: Option<(usize, Candidate)> = None;

    while !matches!(best, Some((0, _))) {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                discard(best).await;
                return Err(multipart_error(e, limit));
            }
        };

        let Some(priority) = field_priority(field.name()) else {
            continue;
        };
        if best.as_ref().is_some_and(|(current, _)| *current <= priority) {
            continue;
        }
        let Some(raw_filename) = field
            .file_name()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
        else {
            continue;
        };

        let candidate = match admit(&raw_filename) {
            Ok(admitted) => {
                let chunks = field.map_err(move |e| multipart_error(e, limit));
                match TempArtifact::materialize(root, &admitted.filename, chunks, limit).await {
                    Ok(artifact) => Candidate::Ready(artifact, admitted),
                    Err(e) => {
                        discard(best).await;
                        return Err(e);
                    }
                }
            }
            Err(e) => Candidate::Rejected(e),
        };
        discard(best.replace((priority, candidate))).await;
    }

    match best {
        Some((_, Candidate::Ready(artifact, admitted))) => Ok((artifact, admitted)),
        Some((_, Candidate::Rejected(e))) => Err(e),
        None => Err(RelayError::NoFileProvided),
    }
}

/// 置き換えられた候補の一時ファイルを削除する。
async fn discard(candidate: Option<(usize, Candidate)>) {
    if let Some((_, Candidate::Ready(artifact, _))) = candidate {
        artifact.release().await;
    }
}

/// OPTIONS /upload: プリフライト。CORSヘッダはミドルウェアが付与する。
pub async fn handle_preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// 認証情報を取得し、一時ファイルを転送する。
///
/// 転送中にトークンが拒否された場合の更新も認証情報マネージャが担う。
async fn transfer(
    state: &GatewayState,
    artifact: &TempArtifact,
    admitted: &AdmittedFile,
) -> Result<UploadedObject, RelayError> {
    let access_token = state.credentials.access_token().await?;

    state
        .storage
        .upload(
            &access_token,
            &state.credentials,
            UploadSource {
                path: artifact.path(),
                filename: &admitted.filename,
                content_type: &admitted.content_type,
            },
        )
        .await
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// ボディ上限超過は413、それ以外は不正なリクエストとして扱う。
fn multipart_error(e: MultipartError, limit: u64) -> RelayError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        RelayError::PayloadTooLarge { limit }
    } else {
        RelayError::MalformedRequest(e.body_text())
    }
}
