//! 分類処理のエラー定義

use thiserror::Error;

/// 推論サービスの境界で返すエラー
///
/// HTTP層ではこの種別を見てステータスコードを決めます。
#[derive(Debug, Error)]
pub enum ClassifyError {
    /// 空のペイロード
    #[error("画像データが空です")]
    EmptyPayload,

    /// デコードできない画像
    #[error("画像をデコードできません: {0}")]
    InvalidImage(#[from] image::ImageError),

    /// モデル出力とクラスラベル数の不一致
    #[error("モデル出力の次元 {actual} がクラス数 {expected} と一致しません")]
    OutputMismatch { expected: usize, actual: usize },

    /// 推論処理中のその他のエラー
    #[error("推論エラー: {0:#}")]
    Inference(anyhow::Error),

    #[error("入出力エラー: {0}")]
    Io(#[from] std::io::Error),
}

impl ClassifyError {
    /// 呼び出し側の入力が原因のエラーかどうか
    pub fn is_client_error(&self) -> bool {
        matches!(self, ClassifyError::EmptyPayload | ClassifyError::InvalidImage(_))
    }
}
