//! データセット読み込みと分割
//!
//! ディレクトリ構成:
//! ```text
//! dataset/
//! ├── Arborio/
//! │   ├── 001.jpg
//! │   └── ...
//! ├── Basmati/
//! └── Jasmine/
//! ```
//! 事前分割済みの場合は `dataset/{train,val,test}/<クラス>/` を読みます。

pub mod augment;
pub mod class_labels;
pub mod split;

use std::path::{Path, PathBuf};

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use augment::{augment_directory, AugmentReport, Augmenter};
pub use class_labels::ClassLabels;
pub use split::{split_directory, SplitRatios, SplitReport};

use crate::preprocess::is_image_file;

/// 画像パスとクラスID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

/// 学習データセット（パスのみ保持し、画像はバッチ作成時に読む）
#[derive(Debug, Clone)]
pub struct RiceDataset {
    samples: Vec<Sample>,
    labels: ClassLabels,
}

impl RiceDataset {
    /// 指定されたクラス順序でディレクトリから読み込む
    ///
    /// 存在しないクラスディレクトリは警告を出してスキップします。
    pub fn from_directory(root: &Path, labels: &ClassLabels) -> Result<Self> {
        let mut samples = Vec::new();

        for (label, class_name) in labels.as_slice().iter().enumerate() {
            let class_dir = root.join(class_name);
            if !class_dir.is_dir() {
                warn!("クラスディレクトリが存在しません: {}", class_dir.display());
                continue;
            }

            let mut paths: Vec<PathBuf> = std::fs::read_dir(&class_dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| is_image_file(path))
                .collect();
            paths.sort();

            samples.extend(paths.into_iter().map(|path| Sample { path, label }));
        }

        Ok(Self {
            samples,
            labels: labels.clone(),
        })
    }

    pub fn from_samples(samples: Vec<Sample>, labels: ClassLabels) -> Self {
        Self { samples, labels }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// クラスごとの枚数
    pub fn class_counts(&self) -> Vec<(String, usize)> {
        self.labels
            .as_slice()
            .iter()
            .enumerate()
            .map(|(id, name)| {
                let count = self.samples.iter().filter(|s| s.label == id).count();
                (name.clone(), count)
            })
            .collect()
    }

    /// シード付きでシャッフルして3分割する（残りはテスト用）
    pub fn shuffle_split(self, train_ratio: f32, val_ratio: f32, seed: u64) -> (Self, Self, Self) {
        let mut samples = self.samples;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let total = samples.len();
        let train_len = ((total as f32 * train_ratio) as usize).min(total);
        let val_len = ((total as f32 * val_ratio) as usize).min(total - train_len);

        let test = samples.split_off(train_len + val_len);
        let val = samples.split_off(train_len);

        (
            Self::from_samples(samples, self.labels.clone()),
            Self::from_samples(val, self.labels.clone()),
            Self::from_samples(test, self.labels),
        )
    }
}

/// 学習/検証/テストの分け方
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SplitMode {
    /// 分割しない（検証にも全データを使う）
    None,
    /// メモリ上でシャッフルして分割
    Random {
        train_ratio: f32,
        val_ratio: f32,
        seed: u64,
    },
    /// `train/` `val/` `test/` に分割済みのディレクトリを読む
    Prepartitioned,
}

impl Default for SplitMode {
    fn default() -> Self {
        SplitMode::Random {
            train_ratio: 0.8,
            val_ratio: 0.1,
            seed: 42,
        }
    }
}

/// 分割済みのデータセット
#[derive(Debug)]
pub struct DatasetSplits {
    pub labels: ClassLabels,
    pub train: RiceDataset,
    pub val: RiceDataset,
    pub test: Option<RiceDataset>,
}

/// データセットを読み込んで分割する
///
/// クラス順序は学習データのディレクトリから辞書順で決めます。
pub fn load_splits(root: &Path, mode: &SplitMode) -> Result<DatasetSplits> {
    let splits = match mode {
        SplitMode::None => {
            let labels = ClassLabels::discover(root)?;
            let all = RiceDataset::from_directory(root, &labels)?;
            DatasetSplits {
                train: all.clone(),
                val: all,
                test: None,
                labels,
            }
        }
        SplitMode::Random {
            train_ratio,
            val_ratio,
            seed,
        } => {
            if *train_ratio <= 0.0 || *val_ratio < 0.0 || train_ratio + val_ratio > 1.0 {
                anyhow::bail!(
                    "分割比率が不正です: train={}, val={}",
                    train_ratio,
                    val_ratio
                );
            }
            let labels = ClassLabels::discover(root)?;
            let all = RiceDataset::from_directory(root, &labels)?;
            let (train, val, test) = all.shuffle_split(*train_ratio, *val_ratio, *seed);
            DatasetSplits {
                labels,
                train,
                val,
                test: (!test.is_empty()).then_some(test),
            }
        }
        SplitMode::Prepartitioned => {
            let train_root = root.join("train");
            let labels = ClassLabels::discover(&train_root)?;
            let train = RiceDataset::from_directory(&train_root, &labels)?;
            let val = RiceDataset::from_directory(&root.join("val"), &labels)?;
            let test_root = root.join("test");
            let test = if test_root.is_dir() {
                Some(RiceDataset::from_directory(&test_root, &labels)?)
            } else {
                None
            };
            DatasetSplits {
                labels,
                train,
                val,
                test,
            }
        }
    };

    if splits.train.is_empty() {
        anyhow::bail!("学習データが見つかりません: {}", root.display());
    }
    if splits.val.is_empty() {
        anyhow::bail!("検証データが見つかりません: {}", root.display());
    }

    info!(
        "データセット: 学習 {} 枚 / 検証 {} 枚 / テスト {} 枚 ({} クラス)",
        splits.train.len(),
        splits.val.len(),
        splits.test.as_ref().map_or(0, RiceDataset::len),
        splits.labels.len()
    );
    for (name, count) in splits.train.class_counts() {
        info!("  クラス '{}': {} 枚", name, count);
    }

    Ok(splits)
}
