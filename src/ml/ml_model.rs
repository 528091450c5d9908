//! 機械学習モデルの共通定義
//!
//! 米粒画像分類用のCNNモデルと関連する設定を提供します。

use anyhow::Result;
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use tracing::debug;

/// 全結合層の隠れユニット数
const HIDDEN_UNITS: usize = 128;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
}

/// 3段の Conv(3x3, padding無し) + MaxPool(2x2) 後の特徴マップの一辺
///
/// 途中で 0 になる場合は `None`。
pub fn feature_map_size(image_size: usize) -> Option<usize> {
    let mut size = image_size;
    for _ in 0..3 {
        size = size.checked_sub(2)? / 2;
        if size == 0 {
            return None;
        }
    }
    Some(size)
}

impl ModelConfig {
    /// モデルを初期化
    ///
    /// 入力サイズが小さすぎて特徴マップが消える場合はエラー。
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<RiceCnn<B>> {
        if self.num_classes == 0 {
            anyhow::bail!("クラス数が0です");
        }
        let feature_map = feature_map_size(self.image_size).ok_or_else(|| {
            anyhow::anyhow!(
                "入力サイズが小さすぎます: {} (最小22x22が必要)",
                self.image_size
            )
        })?;

        // 特徴次元 d = 128チャネル * feature_map * feature_map
        let d = 128 * feature_map * feature_map;
        debug!(
            "モデル構成: 入力 {}x{}, 特徴マップ 128x{}x{}, FC {} -> {} -> {}",
            self.image_size,
            self.image_size,
            feature_map,
            feature_map,
            d,
            HIDDEN_UNITS,
            self.num_classes
        );

        Ok(RiceCnn {
            conv1: Conv2dConfig::new([3, 32], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).init(),
            conv2: Conv2dConfig::new([32, 64], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).init(),
            conv3: Conv2dConfig::new([64, 128], [3, 3]).init(device),
            pool3: MaxPool2dConfig::new([2, 2]).init(),
            fc1: LinearConfig::new(d, HIDDEN_UNITS).init(device),
            fc2: LinearConfig::new(HIDDEN_UNITS, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 米粒分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 3層 (32, 64, 128ch)
/// - Flatten
/// - FC: d -> 128 + ReLU
/// - FC: 128 -> num_classes
/// - Softmax (推論時)
#[derive(Module, Debug)]
pub struct RiceCnn<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 32
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 32 -> 64
    pool2: MaxPool2d,
    conv3: Conv2d<B>, // 64 -> 128
    pool3: MaxPool2d,

    fc1: Linear<B>,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> RiceCnn<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool3.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習・検証用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}
