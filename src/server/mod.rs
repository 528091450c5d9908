//! HTTPサーバー
//!
//! フロントエンドの静的ファイル配信と分類APIを提供します。

pub mod response;
pub mod routes;
pub mod state;

use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::model::ServerSettings;

pub use response::{ApiError, ClassifyResponse};
pub use state::{AppState, SharedState};

/// ルーターを構築
pub fn build_router(state: SharedState, settings: &ServerSettings) -> Router {
    let static_files = ServeDir::new(state.static_dir.join("static"));

    Router::new()
        .route("/", get(routes::index))
        .route("/get-rice-classes", get(routes::get_rice_classes))
        .route("/classify-rice", post(routes::classify_rice))
        .route("/health", get(routes::health))
        .nest_service("/static", static_files)
        .with_state(state)
        .layer(DefaultBodyLimit::max(settings.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// サーバーを起動（Ctrl+C で終了）
pub async fn serve(state: SharedState, settings: &ServerSettings) -> anyhow::Result<()> {
    if !state.static_dir.join("index.html").exists() {
        warn!(
            "フロントエンドのビルドが見つかりません: {}",
            state.static_dir.display()
        );
    }

    let app = build_router(state, settings);

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .with_context(|| format!("不正な待ち受けアドレス: {}:{}", settings.host, settings.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("{} で待ち受けできません", addr))?;
    info!("サーバーを起動しました: http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("サーバーを停止しました");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("シグナル待機に失敗しました: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::dataset::ClassLabels;
    use crate::model::InferenceConfig;
    use crate::service::{Classifier, RiceService};
    use crate::test_support::{pattern_image, png_bytes, FailingClassifier, FixedClassifier};

    const BOUNDARY: &str = "RICESCANBOUNDARY";

    fn app_with(classifier: Arc<dyn Classifier>, static_dir: &Path, max_upload_bytes: usize) -> Router {
        let config = InferenceConfig {
            class_labels: ClassLabels::new(vec![
                "Basmati".to_string(),
                "Jasmine".to_string(),
                "Arborio".to_string(),
            ]),
            model_input_size: 16,
            confidence_threshold: 0.6,
        };
        let service = Arc::new(RiceService::new(classifier, config, None).unwrap());
        let state = Arc::new(AppState::new(service, static_dir.to_path_buf()));
        let settings = ServerSettings {
            max_upload_bytes,
            ..ServerSettings::default()
        };
        build_router(state, &settings)
    }

    fn app(probabilities: Vec<f32>, static_dir: &Path) -> Router {
        app_with(Arc::new(FixedClassifier::new(probabilities, 16)), static_dir, 1024 * 1024)
    }

    fn multipart_request(field: &str, payload: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"rice.png\"\r\n",
                field
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/classify-rice")
            .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let (status, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn sample_png() -> Vec<u8> {
        png_bytes(&pattern_image(30, 20, 2))
    }

    #[tokio::test]
    async fn test_classify_returns_label() {
        let dir = tempfile::tempdir().unwrap();
        let (status, json) = send_json(
            app(vec![0.10, 0.82, 0.08], dir.path()),
            multipart_request("image", &sample_png()),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"], "Jasmine");
        assert!((json["confidence"].as_f64().unwrap() - 0.82).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_classify_low_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let (status, json) = send_json(
            app(vec![0.41, 0.30, 0.29], dir.path()),
            multipart_request("image", &sample_png()),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"], "Rice type cannot be classified");
        assert!(json.get("label").is_none());
    }

    #[tokio::test]
    async fn test_missing_image_field() {
        let dir = tempfile::tempdir().unwrap();
        let (status, json) = send_json(
            app(vec![0.1, 0.8, 0.1], dir.path()),
            multipart_request("file", &sample_png()),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["result"], "No image file found.");
    }

    #[tokio::test]
    async fn test_non_multipart_request() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/classify-rice")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, json) = send_json(app(vec![0.1, 0.8, 0.1], dir.path()), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["result"], "No image file found.");
    }

    #[tokio::test]
    async fn test_invalid_and_empty_images() {
        let dir = tempfile::tempdir().unwrap();
        for payload in [b"definitely not a png".as_slice(), b"".as_slice()] {
            let (status, json) = send_json(
                app(vec![0.1, 0.8, 0.1], dir.path()),
                multipart_request("image", payload),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["result"], "Error processing the image");
            assert!(json["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_inference_failure_hides_detail() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = Arc::new(FailingClassifier {
            num_classes: 3,
            input_size: 16,
        });
        let (status, json) = send_json(
            app_with(classifier, dir.path(), 1024 * 1024),
            multipart_request("image", &sample_png()),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["result"], "Error processing the image");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_upload_limit() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = Arc::new(FixedClassifier::new(vec![0.1, 0.8, 0.1], 16));
        let (status, _) = send(
            app_with(classifier.clone(), dir.path(), 64),
            multipart_request("image", &vec![0u8; 4096]),
        )
        .await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_get_rice_classes_keeps_model_order() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::builder()
            .uri("/get-rice-classes")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send_json(app(vec![0.1, 0.8, 0.1], dir.path()), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!(["Basmati", "Jasmine", "Arborio"]));
    }

    #[tokio::test]
    async fn test_index_missing_build() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (status, body) = send(app(vec![0.1, 0.8, 0.1], dir.path()), request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, b"Frontend build not found.");
    }

    #[tokio::test]
    async fn test_index_and_static_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>ricescan</html>").unwrap();
        std::fs::create_dir_all(dir.path().join("static")).unwrap();
        std::fs::write(dir.path().join("static").join("app.js"), "console.log(1)").unwrap();

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (status, body) = send(app(vec![0.1, 0.8, 0.1], dir.path()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"<html>ricescan</html>");

        let request = Request::builder().uri("/static/app.js").body(Body::empty()).unwrap();
        let (status, body) = send(app(vec![0.1, 0.8, 0.1], dir.path()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"console.log(1)");
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, json) = send_json(app(vec![0.1, 0.8, 0.1], dir.path()), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["num_classes"], 3);
        assert_eq!(json["reference_matching"], false);
    }
}
