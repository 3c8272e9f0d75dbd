//! # OAuth2 認証情報
//!
//! 帯域外で発行された認証情報（クライアントシークレット記述子とトークンレコード）の
//! 読み込み・検証・リフレッシュ・永続化を扱う。
//!
//! - `store`: ファイルの存在確認・読み込み・書き戻し
//! - `manager`: 有効性判定とリフレッシュ（プロセス内で直列化）
//!
//! 対話的な認可フローは一切行わない。トークンが使えなくなった場合は
//! 運用者がコンテナ外で再発行する。

pub mod manager;
pub mod store;

pub use manager::CredentialManager;
pub use store::CredentialStore;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 有効期限のこの秒数前から期限切れとして扱う。
pub const REFRESH_THRESHOLD_SECS: i64 = 225;

/// トークンエンドポイントのデフォルト。
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// 永続化されたトークンレコード（authorized user 形式のJSON）。
///
/// 知らないフィールド（`universe_domain`, `account` 等）は `extra` に保持し、
/// 書き戻し時にそのまま出力する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// アクセストークン
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// リフレッシュトークン
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// トークンエンドポイント
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    /// 発行元クライアントID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// 発行元クライアントシークレット
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// 許可済みスコープ
    #[serde(default)]
    pub scopes: Vec<String>,
    /// アクセストークンの有効期限（UTC）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    /// その他のフィールド
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CredentialRecord {
    /// `now` の時点で期限切れか。期限の無いレコードは期限切れにならない。
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => now >= expiry - Duration::seconds(REFRESH_THRESHOLD_SECS),
            None => false,
        }
    }

    /// アクセストークンを持ち、期限切れでなければ有効。
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        let has_token = self.token.as_deref().is_some_and(|t| !t.is_empty());
        has_token && !self.is_expired(now)
    }

    /// 空でないリフレッシュトークン。
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// クライアントシークレット記述子（`credentials.json`）。
/// `installed` か `web` のいずれかを持つ。
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecretFile {
    #[serde(default)]
    installed: Option<ClientSecretInfo>,
    #[serde(default)]
    web: Option<ClientSecretInfo>,
}

impl ClientSecretFile {
    /// 記述子の本体。形式が不正ならNone。
    pub fn info(&self) -> Option<&ClientSecretInfo> {
        self.installed.as_ref().or(self.web.as_ref())
    }
}

/// 記述子内のクライアント情報。
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecretInfo {
    /// OAuth2クライアントID
    pub client_id: String,
    /// OAuth2クライアントシークレット
    pub client_secret: String,
    /// トークンエンドポイント。無ければ既定値を使う
    #[serde(default)]
    pub token_uri: Option<String>,
}
