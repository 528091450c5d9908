//! モデルメタデータの定義
//!
//! tar.gz形式のモデルファイルに `metadata.json` として同梱されます。
//! クラス名の順序はここに保存されたものが正で、推論時にデータセットのディレクトリを
//! 読み直すことはありません。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dataset::SplitMode;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラス名（出力層のインデックス順）
    /// 例: ["Arborio", "Basmati", "Jasmine"]
    pub class_names: Vec<String>,

    /// モデル入力サイズ（正方形、通常224）
    pub model_input_size: u32,

    /// 学習エポック数（予定値）
    pub num_epochs: u32,

    /// 最良スナップショットのエポック（1始まり）
    pub best_epoch: u32,

    /// 最良スナップショットの検証精度
    pub best_val_accuracy: f64,

    /// テストデータでの精度（テスト分割がある場合のみ）
    #[serde(default)]
    pub test_accuracy: Option<f64>,

    /// 学習時のデータ分割方法
    #[serde(default = "default_split_mode")]
    pub split_mode: SplitMode,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

fn default_split_mode() -> SplitMode {
    SplitMode::None
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_names: Vec<String>,
        model_input_size: u32,
        num_epochs: u32,
        best_epoch: u32,
        best_val_accuracy: f64,
        split_mode: SplitMode,
    ) -> Self {
        Self {
            class_names,
            model_input_size,
            num_epochs,
            best_epoch,
            best_val_accuracy,
            test_accuracy: None,
            split_mode,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// 推論に使えるメタデータか検証
    pub fn validate(&self) -> Result<()> {
        if self.class_names.is_empty() {
            anyhow::bail!("メタデータにクラス名がありません");
        }
        let mut sorted = self.class_names.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != self.class_names.len() {
            anyhow::bail!("クラス名が重複しています: {:?}", self.class_names);
        }
        if self.model_input_size == 0 {
            anyhow::bail!("モデル入力サイズが0です");
        }
        Ok(())
    }
}
