//! # スコープ付き一時ファイル
//!
//! 受信ファイルを一時ディレクトリに書き出し、リクエスト終了時に必ず削除する。
//!
//! ## 削除の保証
//! - 通常経路: ハンドラが `release()` を呼ぶ（消費するので一度しか呼べない）
//! - 中断経路: クライアント切断等でリクエストのFutureが破棄された場合は
//!   `Drop` が同期的に削除する
//!
//! 削除の失敗はログに残すのみで、呼び出し側のエラーにはしない。

use std::path::{Path, PathBuf};

use axum::body::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;

use crate::error::RelayError;

/// リクエストごとに1つだけ作られる一時ファイル。
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
    released: bool,
}

impl TempArtifact {
    /// 一時ファイルを作成し、ストリームの内容を全て書き込んでから返す。
    ///
    /// ファイル名は `{uuid}_{filename}` とし、リクエスト間で衝突しない。
    /// 書き込み途中で `max_bytes` を超えた場合やストリームがエラーを返した場合は、
    /// 書きかけのファイルを削除してからエラーを返す。
    pub async fn materialize<S>(
        root: &Path,
        filename: &str,
        chunks: S,
        max_bytes: u64,
    ) -> Result<Self, RelayError>
    where
        S: Stream<Item = Result<Bytes, RelayError>>,
    {
        tokio::fs::create_dir_all(root).await.map_err(|e| {
            RelayError::Internal(format!(
                "一時ディレクトリの作成に失敗 ({}): {e}",
                root.display()
            ))
        })?;

        let path = root.join(format!("{}_{filename}", uuid::Uuid::new_v4()));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| {
                RelayError::Internal(format!(
                    "一時ファイルの作成に失敗 ({}): {e}",
                    path.display()
                ))
            })?;

        let artifact = Self {
            path,
            released: false,
        };

        match write_chunks(file, chunks, max_bytes).await {
            Ok(written) => {
                tracing::debug!(
                    path = %artifact.path.display(),
                    bytes = written,
                    "一時ファイルを書き込みました"
                );
                Ok(artifact)
            }
            Err(e) => {
                artifact.release().await;
                Err(e)
            }
        }
    }

    /// 一時ファイルのパス。
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 一時ファイルを削除する。
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "一時ファイルを削除できませんでした"
            );
        }
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(
                path = %self.path.display(),
                "中断されたリクエストの一時ファイルを削除しました"
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "一時ファイルを削除できませんでした"
            ),
        }
    }
}

async fn write_chunks<S>(
    mut file: tokio::fs::File,
    chunks: S,
    max_bytes: u64,
) -> Result<u64, RelayError>
where
    S: Stream<Item = Result<Bytes, RelayError>>,
{
    futures::pin_mut!(chunks);

    let mut written: u64 = 0;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(RelayError::PayloadTooLarge { limit: max_bytes });
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| RelayError::Internal(format!("一時ファイルへの書き込みに失敗: {e}")))?;
    }
    file.flush()
        .await
        .map_err(|e| RelayError::Internal(format!("一時ファイルのフラッシュに失敗: {e}")))?;
    Ok(written)
}
