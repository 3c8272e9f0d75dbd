//! # 認証情報ライフサイクル管理
//!
//! トークンレコードを読み込み、有効ならそのまま返し、期限切れでリフレッシュトークンを
//! 持つ場合はトークンエンドポイントで更新して書き戻す。
//!
//! 読み込み → 判定 → リフレッシュ → 書き戻し の一連の処理はプロセス内の
//! 非同期Mutexで直列化する。並行リクエストが同時にリフレッシュして
//! 新しいレコードを古いもので上書きすることはない。
//! トークンエンドポイントへのリクエストにはタイムアウトを設け、応答しない場合でも
//! ロックを握ったまま後続のリクエストを止めることはない。

use chrono::{Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{CredentialRecord, CredentialStore, DEFAULT_TOKEN_URI};
use crate::error::RelayError;
use crate::storage::TokenSource;

/// トークンエンドポイントが `expires_in` を返さなかった場合の有効期間（秒）。
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// トークンエンドポイントの成功レスポンス。
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// トークンエンドポイントのエラーレスポンス。
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// リフレッシュに使うクライアント情報。
struct ClientIdentity {
    token_uri: String,
    client_id: String,
    client_secret: String,
}

/// 認証情報ライフサイクルマネージャ。
pub struct CredentialManager {
    store: CredentialStore,
    http_client: reqwest::Client,
    /// 読み込みから書き戻しまでを直列化するロック
    refresh_lock: Mutex<()>,
}

impl CredentialManager {
    /// 新しいCredentialManagerを作成する。
    pub fn new(store: CredentialStore, http_client: reqwest::Client) -> Self {
        Self {
            store,
            http_client,
            refresh_lock: Mutex::new(()),
        }
    }

    /// トークンエンドポイントへのリクエスト全体に `timeout` を設けたクライアントで作成する。
    pub fn with_timeout(
        store: CredentialStore,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::new(store, http_client))
    }

    /// 使用可能なトークンレコードを返す。
    ///
    /// 1. 両ファイルの存在を確認（ネットワーク通信の前）
    /// 2. レコードが有効ならそのまま返す
    /// 3. 無効でリフレッシュトークンがあれば1回だけリフレッシュし、書き戻して返す
    /// 4. それ以外は `CredentialUnrefreshable`
    pub async fn obtain(&self) -> Result<CredentialRecord, RelayError> {
        let _guard = self.refresh_lock.lock().await;

        self.store.verify_present().await?;
        let record = self.store.load_token().await?;

        if record.is_valid(Utc::now()) {
            return Ok(record);
        }
        self.refresh(record).await
    }

    /// 使用可能なアクセストークンを返す。
    pub async fn access_token(&self) -> Result<String, RelayError> {
        self.obtain().await?.token.ok_or_else(|| {
            RelayError::Internal("有効なレコードにアクセストークンがありません".to_string())
        })
    }

    async fn refresh(&self, mut record: CredentialRecord) -> Result<CredentialRecord, RelayError> {
        let refresh_token = match record.refresh_token() {
            Some(token) => token.to_string(),
            None => {
                return Err(RelayError::CredentialUnrefreshable(
                    "la credencial no tiene refresh_token".to_string(),
                ))
            }
        };

        tracing::info!(
            token_file = %self.store.token_path().display(),
            "トークン期限切れ: リフレッシュを試行します"
        );

        let client = self.client_identity(&record).await?;
        let granted = self.exchange(&client, &refresh_token).await?;

        let expires_in = granted.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        record.token = Some(granted.access_token);
        record.expiry = Some(Utc::now() + Duration::seconds(expires_in));

        self.store.persist_token(&record).await?;
        tracing::info!(expires_in, "トークンをリフレッシュして保存しました");

        Ok(record)
    }

    /// レコードのクライアント情報を使い、欠けていれば記述子で補う。
    async fn client_identity(
        &self,
        record: &CredentialRecord,
    ) -> Result<ClientIdentity, RelayError> {
        if let (Some(client_id), Some(client_secret)) = (&record.client_id, &record.client_secret) {
            return Ok(ClientIdentity {
                token_uri: record
                    .token_uri
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            });
        }

        let info = self.store.load_client_secret().await?;
        Ok(ClientIdentity {
            token_uri: record
                .token_uri
                .clone()
                .or(info.token_uri)
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            client_id: info.client_id,
            client_secret: info.client_secret,
        })
    }

    /// リフレッシュトークンをアクセストークンに交換する。失敗は全て `CredentialUnrefreshable`。
    async fn exchange(
        &self,
        client: &ClientIdentity,
        refresh_token: &str,
    ) -> Result<TokenResponse, RelayError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http_client
            .post(&client.token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "トークンエンドポイントへの送信に失敗");
                RelayError::CredentialUnrefreshable(format!("refresh falló: {e}"))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            RelayError::CredentialUnrefreshable(format!("respuesta de refresh ilegible: {e}"))
        })?;

        if !status.is_success() {
            let reason = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {description}", err.error),
                    None => err.error,
                },
                Err(_) => format!("HTTP {status}: {body}"),
            };
            tracing::error!(%status, reason = %reason, "トークンのリフレッシュが拒否されました");
            return Err(RelayError::CredentialUnrefreshable(reason));
        }

        serde_json::from_str(&body).map_err(|e| {
            RelayError::CredentialUnrefreshable(format!("respuesta de refresh inválida: {e}"))
        })
    }
}

#[async_trait::async_trait]
impl TokenSource for CredentialManager {
    /// 拒否されたトークンに代わるトークンを返す。
    ///
    /// 他のリクエストが既に更新済みで、保存されたトークンが `rejected` と異なり有効なら
    /// それを返す。そうでなければ有効期限に関わらずリフレッシュする。
    async fn renew(&self, rejected: &str) -> Result<String, RelayError> {
        let _guard = self.refresh_lock.lock().await;

        self.store.verify_present().await?;
        let record = self.store.load_token().await?;

        if record.is_valid(Utc::now()) {
            if let Some(token) = record.token.as_deref().filter(|t| *t != rejected) {
                return Ok(token.to_string());
            }
        }

        tracing::warn!("アクセストークンが拒否されました: リフレッシュします");
        let record = self.refresh(record).await?;
        record.token.ok_or_else(|| {
            RelayError::Internal("リフレッシュ後のレコードにアクセストークンがありません".to_string())
        })
    }
}
