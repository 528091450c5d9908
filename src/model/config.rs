//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデル、学習、HTTPサーバー、参照画像照合の設定をJSON形式で保存・読み込みします。
//! 未指定の項目はデフォルト値で補完されます。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::dataset::SplitMode;
use crate::prediction::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::preprocess::DEFAULT_INPUT_SIZE;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            other => Err(format!("不明なデバイス種別です: {}", other)),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// モデルファイル（tar.gz）のパス
    pub model_path: PathBuf,
    /// 学習時の入力サイズ（推論時はモデルファイルの値を使う）
    pub input_size: u32,
    /// 信頼度しきい値
    pub confidence_threshold: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("rice_classifier_model.tar.gz"),
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// データセットのルート
    pub dataset_dir: PathBuf,
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// データ分割方法
    pub split: SplitMode,
    /// 学習時にランダム反転・回転を行うか
    pub augment: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("dataset"),
            num_epochs: 20,
            batch_size: 16,
            num_workers: 1,
            learning_rate: 1e-3,
            seed: 42,
            split: SplitMode::default(),
            augment: false,
        }
    }
}

/// HTTPサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// フロントエンドのビルド出力（index.html と static/）
    pub static_dir: PathBuf,
    /// アップロードサイズ上限（バイト）
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            static_dir: PathBuf::from("ricescan-frontend/dist"),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// 参照画像照合（SSIM）の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherSettings {
    pub enabled: bool,
    /// 参照画像のルート（クラスごとのサブディレクトリ）
    pub dataset_dir: PathBuf,
    /// クラスごとにサンプリングする参照画像の最大枚数
    pub samples_per_class: usize,
    /// 比較前に縮小するサイズ（正方形）
    pub image_size: u32,
    /// 類似度しきい値
    pub threshold: f32,
    /// サンプリングの乱数シード（未指定なら毎回ランダム）
    pub seed: Option<u64>,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            dataset_dir: PathBuf::from("dataset"),
            samples_per_class: 5,
            image_size: 100,
            threshold: 0.6,
            seed: None,
        }
    }
}

/// 撮影・分類サイクルの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// 一時ファイルを置くディレクトリ（未指定ならOSの一時ディレクトリ）
    pub work_dir: Option<PathBuf>,
    /// 撮影画像の保存先
    pub assets_dir: PathBuf,
    /// 撮影画像を保存するか（false なら分類後に削除）
    pub keep_captures: bool,
    /// 監視ループの周期（回/秒）
    pub poll_fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            work_dir: None,
            assets_dir: PathBuf::from("assets"),
            keep_captures: false,
            poll_fps: 30,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// HTTPサーバー設定
    pub server: ServerSettings,
    /// 参照画像照合の設定
    pub matcher: MatcherSettings,
    /// 撮影・分類サイクルの設定
    pub capture: CaptureSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("ricescan.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// コマンドラインから設定を読み込む
    ///
    /// パスを明示した場合はそのファイルが必須で、読めなければエラー。
    /// 省略時はデフォルトパスを探し、なければデフォルト設定を使う。
    pub fn load_explicit_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let config = Self::load(path)
                    .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?;
                info!("設定ファイルを読み込みました: {}", path.display());
                Ok(config)
            }
            None => Ok(Self::load_or_default(&Self::default_path())),
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("モデルパス: {}", self.model.model_path.display());
        println!("信頼度しきい値: {}", self.model.confidence_threshold);
        println!("\n--- トレーニング設定 ---");
        println!("データセット: {}", self.training.dataset_dir.display());
        println!("入力サイズ: {}x{}", self.model.input_size, self.model.input_size);
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("分割: {:?}", self.training.split);
        println!("\n--- サーバー設定 ---");
        println!("待ち受け: {}:{}", self.server.host, self.server.port);
        println!("フロントエンド: {}", self.server.static_dir.display());
        println!("\n--- 参照画像照合 ---");
        println!("有効: {}", self.matcher.enabled);
        if self.matcher.enabled {
            println!("参照画像: {}", self.matcher.dataset_dir.display());
            println!("しきい値: {}", self.matcher.threshold);
        }
        println!("========================\n");
    }
}
