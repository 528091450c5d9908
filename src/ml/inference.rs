//! モデル推論機能

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use tracing::info;

use crate::ml::{ModelConfig, RiceCnn};
use crate::model::{load_model_with_metadata, DeviceType, ModelMetadata};
use crate::preprocess::ImageTensor;
use crate::service::Classifier;

/// 推論エンジン
///
/// モデルは読み込み後に変更しません。バックエンドのテンソルが `Sync` とは限らないため
/// `Mutex` で包んで複数スレッドから共有します。
pub struct InferenceEngine<B: Backend> {
    model: Mutex<RiceCnn<B>>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load(model_path: &Path, device: B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path)
            .with_context(|| format!("モデルを読み込めません: {}", model_path.display()))?;

        let model_config = ModelConfig::new(metadata.num_classes())
            .with_image_size(metadata.model_input_size as usize);
        let model = model_config.init::<B>(&device)?;

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, model_binary, &device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        info!(
            "モデルを読み込みました: {} ({} クラス, 入力 {}x{})",
            model_path.display(),
            metadata.num_classes(),
            metadata.model_input_size,
            metadata.model_input_size
        );

        Ok(Self {
            model: Mutex::new(model),
            metadata,
            device,
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

impl<B: Backend> Classifier for InferenceEngine<B> {
    fn num_classes(&self) -> usize {
        self.metadata.num_classes()
    }

    fn input_size(&self) -> u32 {
        self.metadata.model_input_size
    }

    fn predict(&self, input: &ImageTensor) -> Result<Vec<f32>> {
        if input.size() != self.metadata.model_input_size {
            anyhow::bail!(
                "入力サイズ {} がモデルの入力サイズ {} と一致しません",
                input.size(),
                self.metadata.model_input_size
            );
        }

        let tensor = Tensor::<B, 1>::from_floats(input.data(), &self.device)
            .reshape(input.batch_shape());

        let probabilities = {
            let model = self
                .model
                .lock()
                .map_err(|_| anyhow::anyhow!("モデルのロックが破損しています"))?;
            model.probabilities(tensor)
        };

        probabilities
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))
    }
}

/// デバイス設定に応じたバックエンドでモデルを読み込む
pub fn load_classifier(
    model_path: &Path,
    device_type: DeviceType,
) -> Result<(Arc<dyn Classifier>, ModelMetadata)> {
    info!("推論デバイス: {}", device_type);
    match device_type {
        DeviceType::Wgpu => {
            let engine = InferenceEngine::<burn::backend::Wgpu>::load(
                model_path,
                burn_wgpu::WgpuDevice::default(),
            )?;
            let metadata = engine.metadata().clone();
            Ok((Arc::new(engine), metadata))
        }
        DeviceType::Cpu => {
            let engine = InferenceEngine::<burn::backend::NdArray>::load(
                model_path,
                burn_ndarray::NdArrayDevice::Cpu,
            )?;
            let metadata = engine.metadata().clone();
            Ok((Arc::new(engine), metadata))
        }
    }
}
