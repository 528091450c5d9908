//! 推論サービス
//!
//! 起動時に一度だけ構築し、`Arc<RiceService>` として全リクエストで共有します。
//! 構築後は変更しません。

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use image::DynamicImage;
use tracing::{debug, info};

use crate::error::ClassifyError;
use crate::matcher::ReferenceMatcher;
use crate::model::InferenceConfig;
use crate::prediction::{decide, Outcome};
use crate::preprocess::{decode_image, open_image, to_tensor, ImageTensor};

/// 画像1枚の確率分布を返す分類器
pub trait Classifier: Send + Sync {
    /// 出力層の次元
    fn num_classes(&self) -> usize;

    /// 入力画像の一辺のピクセル数
    fn input_size(&self) -> u32;

    /// 順伝播してクラスごとの確率を返す
    fn predict(&self, input: &ImageTensor) -> Result<Vec<f32>>;
}

/// 推論サービスのコンテキスト
pub struct RiceService {
    classifier: Arc<dyn Classifier>,
    config: InferenceConfig,
    matcher: Option<ReferenceMatcher>,
}

impl RiceService {
    /// サービスを構築
    ///
    /// 分類器の出力次元とクラス数、入力サイズが一致しない場合はエラー（起動失敗）。
    pub fn new(
        classifier: Arc<dyn Classifier>,
        config: InferenceConfig,
        matcher: Option<ReferenceMatcher>,
    ) -> Result<Self> {
        if config.class_labels.is_empty() {
            anyhow::bail!("クラスラベルが空です");
        }
        if classifier.num_classes() != config.num_classes() {
            anyhow::bail!(
                "モデルの出力次元 {} とクラス数 {} が一致しません",
                classifier.num_classes(),
                config.num_classes()
            );
        }
        if classifier.input_size() != config.model_input_size {
            anyhow::bail!(
                "モデルの入力サイズ {} と設定 {} が一致しません",
                classifier.input_size(),
                config.model_input_size
            );
        }

        info!(
            "推論サービスを初期化しました: {} クラス, 入力 {}x{}, しきい値 {}, 参照照合 {}",
            config.num_classes(),
            config.model_input_size,
            config.model_input_size,
            config.confidence_threshold,
            if matcher.is_some() { "有効" } else { "無効" }
        );

        Ok(Self {
            classifier,
            config,
            matcher,
        })
    }

    /// クラス名（出力層の順序）
    pub fn class_names(&self) -> &[String] {
        self.config.class_labels.as_slice()
    }

    pub fn has_matcher(&self) -> bool {
        self.matcher.is_some()
    }

    /// アップロードされたバイト列を分類
    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<Outcome, ClassifyError> {
        let image = decode_image(bytes)?;
        self.classify_image(&image)
    }

    /// 画像ファイルを分類
    pub fn classify_path(&self, path: &Path) -> Result<Outcome, ClassifyError> {
        let image = open_image(path)?;
        self.classify_image(&image)
    }

    /// デコード済みの画像を分類
    ///
    /// 参照照合が有効な場合は先に照合し、棄却されたら分類器は呼びません。
    pub fn classify_image(&self, image: &DynamicImage) -> Result<Outcome, ClassifyError> {
        if let Some(matcher) = &self.matcher {
            let reference = matcher.best_match(image);
            if !reference.accepted {
                info!(
                    "参照画像と一致しませんでした (最良スコア {:.3})",
                    reference.score
                );
                return Ok(Outcome::NoReferenceMatch {
                    best_score: reference.score,
                });
            }
            debug!(
                "参照画像照合: {:?} (スコア {:.3})",
                reference.class_name, reference.score
            );
        }

        let tensor = to_tensor(image, self.config.model_input_size);
        let probabilities = self
            .classifier
            .predict(&tensor)
            .map_err(ClassifyError::Inference)?;

        let outcome = decide(
            &probabilities,
            self.class_names(),
            self.config.confidence_threshold,
        )?;

        match &outcome {
            Outcome::Classified {
                label, confidence, ..
            } => info!("予測クラス: {} ({:.2}%)", label, confidence * 100.0),
            Outcome::Unclassified { confidence } => {
                info!("信頼度不足で分類できません ({:.2}%)", confidence * 100.0)
            }
            Outcome::NoReferenceMatch { .. } => {}
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ClassLabels;
    use crate::matcher::ReferenceIndex;
    use crate::model::MatcherSettings;
    use crate::test_support::{pattern_image, png_bytes, FailingClassifier, FixedClassifier};
    use image::{Rgb, RgbImage};

    fn rice_config(threshold: f32) -> InferenceConfig {
        InferenceConfig {
            class_labels: ClassLabels::new(vec![
                "Basmati".to_string(),
                "Jasmine".to_string(),
                "Arborio".to_string(),
            ]),
            model_input_size: 16,
            confidence_threshold: threshold,
        }
    }

    fn service_with(probabilities: Vec<f32>) -> (RiceService, Arc<FixedClassifier>) {
        let classifier = Arc::new(FixedClassifier::new(probabilities, 16));
        let service = RiceService::new(classifier.clone(), rice_config(0.6), None).unwrap();
        (service, classifier)
    }

    fn sample_png() -> Vec<u8> {
        png_bytes(&pattern_image(40, 30, 1))
    }

    #[test]
    fn test_jasmine_scenario() {
        let (service, _) = service_with(vec![0.10, 0.82, 0.08]);
        let outcome = service.classify_bytes(&sample_png()).unwrap();
        assert_eq!(outcome.label(), Some("Jasmine"));
        assert!(matches!(outcome, Outcome::Classified { confidence, .. } if (confidence - 0.82).abs() < 1e-6));
    }

    #[test]
    fn test_low_confidence_scenario() {
        let (service, _) = service_with(vec![0.41, 0.30, 0.29]);
        let outcome = service.classify_bytes(&sample_png()).unwrap();
        assert_eq!(outcome, Outcome::Unclassified { confidence: 0.41 });
    }

    #[test]
    fn test_repeated_calls_are_identical() {
        let (service, classifier) = service_with(vec![0.05, 0.15, 0.80]);
        let bytes = sample_png();
        let first = service.classify_bytes(&bytes).unwrap();
        for _ in 0..5 {
            assert_eq!(service.classify_bytes(&bytes).unwrap(), first);
        }
        assert_eq!(classifier.calls(), 6);
    }

    #[test]
    fn test_label_is_member_of_class_names() {
        let (service, _) = service_with(vec![0.0, 0.0, 1.0]);
        let outcome = service.classify_bytes(&sample_png()).unwrap();
        let label = outcome.label().unwrap();
        assert!(service.class_names().iter().any(|n| n == label));
    }

    #[test]
    fn test_malformed_bytes_are_errors() {
        let (service, classifier) = service_with(vec![0.1, 0.8, 0.1]);
        assert!(matches!(service.classify_bytes(&[]), Err(ClassifyError::EmptyPayload)));
        let err = service.classify_bytes(b"GIF89a but not really").unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(classifier.calls(), 0);
    }

    #[test]
    fn test_inference_failure_is_wrapped() {
        let classifier = Arc::new(FailingClassifier {
            num_classes: 3,
            input_size: 16,
        });
        let service = RiceService::new(classifier, rice_config(0.6), None).unwrap();
        let err = service.classify_bytes(&sample_png()).unwrap_err();
        assert!(matches!(err, ClassifyError::Inference(_)));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_new_rejects_mismatched_model() {
        let classifier = Arc::new(FixedClassifier::new(vec![0.5, 0.5], 16));
        assert!(RiceService::new(classifier, rice_config(0.6), None).is_err());

        let classifier = Arc::new(FixedClassifier::new(vec![0.2, 0.3, 0.5], 32));
        assert!(RiceService::new(classifier, rice_config(0.6), None).is_err());
    }

    #[test]
    fn test_reference_gate_skips_classifier() {
        let dir = tempfile::tempdir().unwrap();
        let class_dir = dir.path().join("Jasmine");
        std::fs::create_dir_all(&class_dir).unwrap();
        RgbImage::from_fn(48, 48, |x, y| {
            if (x / 6 + y / 6) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
        .save(class_dir.join("ref.png"))
        .unwrap();

        let settings = MatcherSettings {
            enabled: true,
            dataset_dir: dir.path().to_path_buf(),
            samples_per_class: 5,
            image_size: 32,
            threshold: 0.6,
            seed: Some(11),
        };
        let matcher = ReferenceMatcher::new(ReferenceIndex::scan(dir.path()).unwrap(), &settings);
        let classifier = Arc::new(FixedClassifier::new(vec![0.1, 0.8, 0.1], 16));
        let service = RiceService::new(classifier.clone(), rice_config(0.6), Some(matcher)).unwrap();

        let flat = png_bytes(&RgbImage::from_pixel(48, 48, Rgb([120, 120, 120])));
        let outcome = service.classify_bytes(&flat).unwrap();
        assert!(matches!(outcome, Outcome::NoReferenceMatch { .. }));
        assert_eq!(classifier.calls(), 0);

        // 参照画像と同じ画像なら分類器まで進む
        let same = std::fs::read(class_dir.join("ref.png")).unwrap();
        let outcome = service.classify_bytes(&same).unwrap();
        assert_eq!(outcome.label(), Some("Jasmine"));
        assert_eq!(classifier.calls(), 1);
    }
}
