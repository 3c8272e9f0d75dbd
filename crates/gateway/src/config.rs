//! # Gateway設定・共有状態
//!
//! 環境変数からの設定読み込みとGatewayの共有状態の定義。
//! 設定の不備は起動時エラーであり、リクエスト時には発生しない。

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::credentials::CredentialManager;
use crate::storage::drive::DEFAULT_CHUNK_SIZE;
use crate::storage::RemoteStorage;

/// アップロードサイズ上限のデフォルト（2 GiB）。
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// CORS許可オリジンのデフォルト。
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "https://sircom.cl",
    "https://www.sircom.cl",
    "https://sircom.jumpseller.com",
    "https://www.sircom.jumpseller.com",
];

/// Drive APIのデフォルトベースURL。
pub const DEFAULT_GOOGLE_API_BASE: &str = "https://www.googleapis.com";

/// 再送回数のデフォルト。
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// トークンエンドポイントへのリクエストのタイムアウト（秒）。
pub const DEFAULT_TOKEN_TIMEOUT_SECS: u64 = 30;

/// Drive APIへの1リクエスト（1チャンク）のタイムアウト（秒）。
pub const DEFAULT_DRIVE_TIMEOUT_SECS: u64 = 300;

/// Gateway設定。
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// 待ち受けアドレス
    pub bind_addr: SocketAddr,
    /// 保存先フォルダID
    pub folder_id: String,
    /// トークンレコードのパス
    pub token_file: PathBuf,
    /// クライアントシークレット記述子のパス
    pub credentials_file: PathBuf,
    /// 一時ファイルのルートディレクトリ
    pub upload_tmp_dir: PathBuf,
    /// アップロード最大サイズ（バイト）
    pub max_upload_bytes: u64,
    /// CORS許可オリジン（完全一致）
    pub allowed_origins: Vec<String>,
    /// Drive APIのベースURL
    pub google_api_base: String,
    /// 再開可能アップロードのチャンクサイズ
    pub drive_chunk_size: usize,
    /// 一時的な失敗の再送回数
    pub drive_max_retries: u32,
    /// トークンエンドポイントへのリクエストのタイムアウト
    pub token_timeout: Duration,
    /// Drive APIへの1リクエストのタイムアウト
    pub drive_timeout: Duration,
}

impl RelayConfig {
    /// プロセス環境変数から設定を読み込む。
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 任意の参照関数から設定を読み込む。
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr: SocketAddr = var("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:5000".to_string())
            .parse()
            .context("BIND_ADDR が不正です")?;

        let folder_id = var("GOOGLE_DRIVE_FOLDER_ID")
            .context("GOOGLE_DRIVE_FOLDER_ID が未設定です")?;

        let allowed_origins = match var("ALLOWED_ORIGINS") {
            Some(list) => list
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            None => DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect(),
        };

        let max_upload_bytes =
            parse_or(var("MAX_UPLOAD_BYTES"), "MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?;
        let drive_chunk_size =
            parse_or(var("DRIVE_CHUNK_SIZE"), "DRIVE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        let drive_max_retries =
            parse_or(var("DRIVE_MAX_RETRIES"), "DRIVE_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        let token_timeout_secs = parse_or(
            var("TOKEN_TIMEOUT_SECS"),
            "TOKEN_TIMEOUT_SECS",
            DEFAULT_TOKEN_TIMEOUT_SECS,
        )?;
        let drive_timeout_secs = parse_or(
            var("DRIVE_TIMEOUT_SECS"),
            "DRIVE_TIMEOUT_SECS",
            DEFAULT_DRIVE_TIMEOUT_SECS,
        )?;

        Ok(Self {
            bind_addr,
            folder_id,
            token_file: var("GOOGLE_TOKEN_FILE")
                .unwrap_or_else(|| "token.json".to_string())
                .into(),
            credentials_file: var("GOOGLE_CREDENTIALS_FILE")
                .unwrap_or_else(|| "credentials.json".to_string())
                .into(),
            upload_tmp_dir: var("UPLOAD_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            max_upload_bytes,
            allowed_origins,
            google_api_base: var("GOOGLE_API_BASE")
                .unwrap_or_else(|| DEFAULT_GOOGLE_API_BASE.to_string()),
            drive_chunk_size,
            drive_max_retries,
            token_timeout: Duration::from_secs(token_timeout_secs),
            drive_timeout: Duration::from_secs(drive_timeout_secs),
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{key} が不正です: {v}")),
        None => Ok(default),
    }
}

/// Gatewayの共有状態。
pub struct GatewayState {
    /// 起動時に読み込んだ設定
    pub config: RelayConfig,
    /// 認証情報ライフサイクル管理
    pub credentials: CredentialManager,
    /// アップロード先（トレイトで抽象化）
    pub storage: Box<dyn RemoteStorage>,
}
