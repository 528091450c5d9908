//! ルートハンドラー

use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    http::StatusCode,
    response::Html,
    Json,
};
use serde::Serialize;
use tracing::{debug, error};

use crate::server::response::{ApiError, ClassifyResponse};
use crate::server::state::SharedState;

/// アップロード画像のフィールド名
const IMAGE_FIELD: &str = "image";

/// GET / - フロントエンドの index.html
pub async fn index(State(state): State<SharedState>) -> Result<Html<String>, (StatusCode, &'static str)> {
    let path = state.static_dir.join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(html) => Ok(Html(html)),
        Err(e) => {
            error!("index.html を読み込めません {}: {}", path.display(), e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Frontend build not found."))
        }
    }
}

/// GET /get-rice-classes - クラス名（出力層の順序）
pub async fn get_rice_classes(State(state): State<SharedState>) -> Json<Vec<String>> {
    Json(state.service.class_names().to_vec())
}

/// POST /classify-rice - multipart の `image` フィールドを分類
pub async fn classify_rice(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ClassifyResponse>, ApiError> {
    let mut multipart = multipart.map_err(|rejection| {
        debug!("multipart ではないリクエスト: {}", rejection);
        ApiError::NoImage
    })?;

    let mut image = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return Err(ApiError::Upload {
                    status: e.status(),
                    detail: e.body_text(),
                })
            }
        };

        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let bytes = field.bytes().await.map_err(|e| ApiError::Upload {
            status: e.status(),
            detail: e.body_text(),
        })?;
        image = Some(bytes);
        break;
    }

    let bytes = image.ok_or(ApiError::NoImage)?;
    debug!("画像を受信しました: {} バイト", bytes.len());

    let service = state.service.clone();
    let outcome = tokio::task::spawn_blocking(move || service.classify_bytes(&bytes))
        .await
        .map_err(|e| anyhow::anyhow!("分類スレッドエラー: {}", e))??;

    Ok(Json(ClassifyResponse::from(outcome)))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub num_classes: usize,
    pub reference_matching: bool,
}

/// GET /health - ヘルスチェック
pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        num_classes: state.service.class_names().len(),
        reference_matching: state.service.has_matcher(),
    })
}
