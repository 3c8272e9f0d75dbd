//! # 認証情報ストア
//!
//! 設定されたパスにあるクライアントシークレット記述子とトークンレコードを扱う。
//! ネットワーク通信の前に両ファイルの存在を確認する。

use std::path::{Path, PathBuf};

use super::{ClientSecretFile, ClientSecretInfo, CredentialRecord};
use crate::error::RelayError;

/// ファイルシステム上の認証情報ストア。
#[derive(Debug, Clone)]
pub struct CredentialStore {
    /// クライアントシークレット記述子のパス
    client_secret_path: PathBuf,
    /// トークンレコードのパス
    token_path: PathBuf,
}

impl CredentialStore {
    /// 新しいCredentialStoreを作成する。
    pub fn new(client_secret_path: impl Into<PathBuf>, token_path: impl Into<PathBuf>) -> Self {
        Self {
            client_secret_path: client_secret_path.into(),
            token_path: token_path.into(),
        }
    }

    /// トークンレコードのパス。
    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// 両ファイルの存在を確認する。
    ///
    /// どちらも帯域外でのプロビジョニングが必要なため、欠けていれば致命的エラーとなる。
    pub async fn verify_present(&self) -> Result<(), RelayError> {
        if !exists(&self.client_secret_path).await? {
            return Err(RelayError::MissingCredentialFile(
                self.client_secret_path.display().to_string(),
            ));
        }
        if !exists(&self.token_path).await? {
            return Err(RelayError::MissingTokenFile(
                self.token_path.display().to_string(),
            ));
        }
        Ok(())
    }

    /// クライアントシークレット記述子を読み込み、形式を検証する。
    pub async fn load_client_secret(&self) -> Result<ClientSecretInfo, RelayError> {
        let bytes = read(&self.client_secret_path).await?;
        let file: ClientSecretFile = serde_json::from_slice(&bytes).map_err(|e| {
            RelayError::CredentialFormat(format!(
                "{} のパースに失敗: {e}",
                self.client_secret_path.display()
            ))
        })?;
        file.info().cloned().ok_or_else(|| {
            RelayError::CredentialFormat(format!(
                "{} に installed / web のいずれもありません",
                self.client_secret_path.display()
            ))
        })
    }

    /// トークンレコードを読み込む。
    pub async fn load_token(&self) -> Result<CredentialRecord, RelayError> {
        let bytes = read(&self.token_path).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            RelayError::CredentialFormat(format!(
                "{} のパースに失敗: {e}",
                self.token_path.display()
            ))
        })
    }

    /// トークンレコード全体を書き戻す。
    ///
    /// 同じディレクトリの一時ファイルに書いてからリネームするため、
    /// 読み手が書きかけのJSONを見ることはない。
    pub async fn persist_token(&self, record: &CredentialRecord) -> Result<(), RelayError> {
        let json = serde_json::to_vec(record)
            .map_err(|e| RelayError::Internal(format!("トークンのシリアライズに失敗: {e}")))?;

        let mut tmp = self.token_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &json).await.map_err(|e| {
            RelayError::Internal(format!("トークンの書き込みに失敗 ({}): {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &self.token_path).await.map_err(|e| {
            RelayError::Internal(format!(
                "トークンの置き換えに失敗 ({}): {e}",
                self.token_path.display()
            ))
        })
    }
}

async fn exists(path: &Path) -> Result<bool, RelayError> {
    tokio::fs::try_exists(path).await.map_err(|e| {
        RelayError::Internal(format!("ファイルの確認に失敗 ({}): {e}", path.display()))
    })
}

async fn read(path: &Path) -> Result<Vec<u8>, RelayError> {
    tokio::fs::read(path).await.map_err(|e| {
        RelayError::Internal(format!("ファイルの読み込みに失敗 ({}): {e}", path.display()))
    })
}
