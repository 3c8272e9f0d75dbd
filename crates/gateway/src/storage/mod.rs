//! # リモートストレージ
//!
//! アップロード先プロバイダの抽象インターフェース。
//! Google Drive 実装は `drive` サブモジュールを参照。

pub mod drive;

pub use drive::DriveStorage;

use std::path::Path;

use crate::error::RelayError;

/// 転送するファイルの情報。
#[derive(Debug, Clone, Copy)]
pub struct UploadSource<'a> {
    /// 一時ファイルのパス
    pub path: &'a Path,
    /// リモート側に付けるファイル名
    pub filename: &'a str,
    /// Content-Type
    pub content_type: &'a str,
}

/// 転送完了後にプロバイダが返したオブジェクト参照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    /// リモートオブジェクトID
    pub id: String,
    /// 閲覧用リンク（プロバイダが返した場合のみ）
    pub web_view_link: Option<String>,
}

/// 転送中にアクセストークンが拒否された場合の更新元。
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// `rejected` に代わるアクセストークンを返す。
    async fn renew(&self, rejected: &str) -> Result<String, RelayError>;
}

/// リモートストレージの抽象インターフェース。
///
/// 1回の呼び出しがチャンク単位の再送を内部に閉じ込め、
/// 成功か失敗のどちらか1つの結果だけを返す。
/// 転送中に `access_token` が401で拒否された場合は `tokens` から1度だけ更新して続行する。
#[async_trait::async_trait]
pub trait RemoteStorage: Send + Sync {
    /// ファイルを固定の保存先にアップロードする。
    async fn upload(
        &self,
        access_token: &str,
        tokens: &dyn TokenSource,
        source: UploadSource<'_>,
    ) -> Result<UploadedObject, RelayError>;
}
