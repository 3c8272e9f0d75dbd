//! # アップロード受付・検証
//!
//! 受信ファイル名のサニタイズ、拡張子の許可リスト判定、Content-Typeの推定を行う。
//! 副作用を持たない純粋関数のみで構成する。

use unicode_normalization::UnicodeNormalization;

use crate::error::RelayError;

/// ファイルを受け付けるmultipartフィールド名（優先順）。
/// フロントエンドの実装差異に備えて複数のキーを許容する。
pub const ACCEPTED_FIELDS: [&str; 3] = ["file", "archivo", "files[]"];

/// アップロードを許可する拡張子（小文字）。
pub const ALLOWED_EXTENSIONS: [&str; 6] = ["pdf", "jpeg", "jpg", "png", "doc", "docx"];

/// 受付済みファイルの情報。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedFile {
    /// ファイルシステム上で安全なファイル名
    pub filename: String,
    /// 拡張子から推定したContent-Type
    pub content_type: String,
}

/// multipartフィールド名の優先順位を返す。受理対象外ならNone。
pub fn field_priority(name: Option<&str>) -> Option<usize> {
    let name = name?;
    ACCEPTED_FIELDS.iter().position(|accepted| *accepted == name)
}

/// ファイル名をファイルシステムで安全に扱える形に変換する。
///
/// NFKD正規化で結合文字を分解してから（`ñ` → `n` + 結合チルダ）、
/// パス区切り文字は空白として扱い、連続する空白は `_` 1文字にまとめる。
/// `[A-Za-z0-9_.-]` 以外の文字は除去し、先頭・末尾の `.` と `_` を取り除く。
pub fn sanitize_filename(raw: &str) -> String {
    let spaced: String = raw
        .nfkd()
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// 最後の `.` 以降を拡張子として許可リストと照合する（大文字小文字は区別しない）。
pub fn has_allowed_extension(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((_, ext)) => {
            let ext = ext.to_ascii_lowercase();
            ALLOWED_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

/// 拡張子からContent-Typeを推定する。不明な場合は `application/octet-stream`。
pub fn content_type_hint(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// 生のファイル名を検証し、保存・転送に使うファイル名とContent-Typeを決定する。
pub fn admit(raw_filename: &str) -> Result<AdmittedFile, RelayError> {
    let filename = sanitize_filename(raw_filename);
    if filename.is_empty() {
        return Err(RelayError::EmptyFilename);
    }
    if !has_allowed_extension(&filename) {
        return Err(RelayError::DisallowedExtension);
    }
    let content_type = content_type_hint(&filename);
    Ok(AdmittedFile {
        filename,
        content_type,
    })
}
