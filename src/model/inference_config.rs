//! モデルメタデータから推論設定を作る

use std::path::Path;

use anyhow::{Context, Result};

use crate::dataset::ClassLabels;
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage;

/// 推論に必要な情報
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// クラスラベル（出力層の順序）
    pub class_labels: ClassLabels,

    /// モデル入力解像度
    pub model_input_size: u32,

    /// 信頼度しきい値（これを超えた場合のみラベルを返す）
    pub confidence_threshold: f32,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata, confidence_threshold: f32) -> Self {
        Self {
            class_labels: ClassLabels::new(metadata.class_names.clone()),
            model_input_size: metadata.model_input_size,
            confidence_threshold,
        }
    }

    /// モデルファイルから推論設定を読み込む
    pub fn load_from_model(model_path: &Path, confidence_threshold: f32) -> Result<Self> {
        let metadata = model_storage::load_metadata(model_path)
            .context("Failed to load model metadata")?;
        Ok(Self::from_metadata(&metadata, confidence_threshold))
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// クラスインデックスからラベルを取得（範囲外は `None`）
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.class_labels.get(index)
    }

    /// 設定情報を表示
    pub fn print_info(&self) {
        println!("\n=== 推論設定 ===");
        println!("クラス: {}", self.class_labels.as_slice().join(", "));
        println!("モデル入力サイズ: {}x{}", self.model_input_size, self.model_input_size);
        println!("信頼度しきい値: {}", self.confidence_threshold);
        println!("==================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SplitMode;

    #[test]
    fn test_index_mapping() {
        let metadata = ModelMetadata::new(
            vec!["Basmati".into(), "Jasmine".into(), "Arborio".into()],
            224,
            20,
            1,
            0.5,
            SplitMode::None,
        );
        let config = InferenceConfig::from_metadata(&metadata, 0.6);

        assert_eq!(config.num_classes(), 3);
        assert_eq!(config.class_index_to_label(1), Some("Jasmine"));
        assert_eq!(config.class_index_to_label(3), None);
    }

    #[test]
    fn test_load_from_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = ModelMetadata::new(vec!["A".into(), "B".into()], 150, 5, 5, 1.0, SplitMode::None);
        let path = model_storage::save_model_with_metadata(&dir.path().join("m"), &metadata, b"").unwrap();

        let config = InferenceConfig::load_from_model(&path, 0.7).unwrap();
        assert_eq!(config.model_input_size, 150);
        assert_eq!(config.confidence_threshold, 0.7);
    }
}
