//! HTTPレスポンスの形式とエラーの対応付け

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::ClassifyError;
use crate::prediction::Outcome;

pub const UNCLASSIFIED_MESSAGE: &str = "Rice type cannot be classified";
pub const NO_IMAGE_MESSAGE: &str = "No image file found.";
pub const PROCESSING_ERROR_MESSAGE: &str = "Error processing the image";
pub const NO_REFERENCE_MATCH_REASON: &str = "no_reference_match";

/// `/classify-rice` のレスポンス
///
/// `result` は常に入り、それ以外は状況に応じて付きます。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifyResponse {
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClassifyResponse {
    fn message(result: &str) -> Self {
        Self {
            result: result.to_string(),
            label: None,
            confidence: None,
            reason: None,
            best_score: None,
            error: None,
        }
    }
}

impl From<Outcome> for ClassifyResponse {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Classified {
                label, confidence, ..
            } => Self {
                result: label.clone(),
                label: Some(label),
                confidence: Some(confidence),
                ..Self::message("")
            },
            Outcome::Unclassified { confidence } => Self {
                confidence: Some(confidence),
                ..Self::message(UNCLASSIFIED_MESSAGE)
            },
            Outcome::NoReferenceMatch { best_score } => Self {
                reason: Some(NO_REFERENCE_MATCH_REASON.to_string()),
                best_score: Some(best_score),
                ..Self::message(UNCLASSIFIED_MESSAGE)
            },
        }
    }
}

/// ハンドラーが返すエラー
#[derive(Debug)]
pub enum ApiError {
    /// `image` フィールドがない
    NoImage,
    /// アップロードの読み取り失敗（サイズ超過など）
    Upload { status: StatusCode, detail: String },
    Classify(ClassifyError),
    Internal(anyhow::Error),
}

impl From<ClassifyError> for ApiError {
    fn from(err: ClassifyError) -> Self {
        ApiError::Classify(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NoImage => (StatusCode::BAD_REQUEST, ClassifyResponse::message(NO_IMAGE_MESSAGE)),
            ApiError::Upload { status, detail } => {
                warn!("アップロードの読み取りに失敗しました: {}", detail);
                (
                    status,
                    ClassifyResponse {
                        error: Some(detail),
                        ..ClassifyResponse::message(PROCESSING_ERROR_MESSAGE)
                    },
                )
            }
            ApiError::Classify(err) if err.is_client_error() => {
                warn!("不正な画像: {}", err);
                (
                    StatusCode::BAD_REQUEST,
                    ClassifyResponse {
                        error: Some(err.to_string()),
                        ..ClassifyResponse::message(PROCESSING_ERROR_MESSAGE)
                    },
                )
            }
            ApiError::Classify(err) => {
                error!("分類中にエラーが発生しました: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ClassifyResponse::message(PROCESSING_ERROR_MESSAGE),
                )
            }
            ApiError::Internal(err) => {
                error!("分類中にエラーが発生しました: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ClassifyResponse::message(PROCESSING_ERROR_MESSAGE),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
