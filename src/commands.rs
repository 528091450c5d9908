//! CLI から呼ぶ処理（推論サービスの構築と学習）

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
#[cfg(feature = "ml")]
use anyhow::Context;
#[cfg(feature = "ml")]
use tracing::info;

use crate::model::AppConfig;
use crate::service::RiceService;
#[cfg(feature = "ml")]
use crate::{
    matcher::ReferenceMatcher,
    ml::load_classifier,
    model::{artifact_path, InferenceConfig},
};

/// モデルファイルを読み込んで推論サービスを構築
///
/// モデルや参照画像ディレクトリが読めない場合はエラー（起動失敗）。
#[cfg(feature = "ml")]
pub fn load_service(config: &AppConfig) -> Result<Arc<RiceService>> {
    let model_path = artifact_path(&config.model.model_path);
    if !model_path.exists() {
        anyhow::bail!("モデルファイルが見つかりません: {}", model_path.display());
    }

    let (classifier, metadata) = load_classifier(&model_path, config.device_type)?;
    let inference = InferenceConfig::from_metadata(&metadata, config.model.confidence_threshold);

    let matcher = if config.matcher.enabled {
        let matcher = ReferenceMatcher::from_settings(&config.matcher).with_context(|| {
            format!(
                "参照画像を読み込めません: {}",
                config.matcher.dataset_dir.display()
            )
        })?;
        info!(
            "参照画像照合を有効化しました: {} クラス",
            matcher.index().num_classes()
        );
        Some(matcher)
    } else {
        None
    };

    Ok(Arc::new(RiceService::new(classifier, inference, matcher)?))
}

/// 学習を実行してモデルファイルを書き出す
#[cfg(feature = "ml")]
pub fn train(config: &AppConfig, output_path: &Path) -> Result<()> {
    let summary = crate::ml::run_training(config, output_path, |report| {
        println!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}{}",
            report.epoch,
            report.num_epochs,
            report.train_loss,
            report.train_accuracy,
            report.val_loss,
            report.val_accuracy,
            if report.improved { " (saved)" } else { "" }
        );
    })?;

    println!(
        "学習完了: {} に保存しました (エポック {}, 検証精度 {:.2}%)",
        summary.model_path.display(),
        summary.best_epoch,
        summary.best_val_accuracy * 100.0
    );
    if let Some(accuracy) = summary.test_accuracy {
        println!("テスト精度: {:.2}%", accuracy * 100.0);
    }
    println!("クラス: {}", summary.class_names.join(", "));
    Ok(())
}

#[cfg(not(feature = "ml"))]
pub fn load_service(_config: &AppConfig) -> Result<Arc<RiceService>> {
    anyhow::bail!("機械学習機能が有効化されていません")
}

#[cfg(not(feature = "ml"))]
pub fn train(_config: &AppConfig, _output_path: &Path) -> Result<()> {
    anyhow::bail!("機械学習機能が有効化されていません")
}
