//! データ拡張
//!
//! - `augment_directory`: 回転コピーでデータセットを4倍にする（オフライン）
//! - `Augmenter`: 学習時のランダム反転・回転

use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use super::class_labels::ClassLabels;
use crate::preprocess::is_image_file;

/// 回転拡張の結果
#[derive(Debug, Default, Clone, Serialize)]
pub struct AugmentReport {
    /// 処理できた元画像の枚数
    pub processed: usize,
    /// 読み込めずスキップした画像
    pub skipped: Vec<String>,
}

/// 各画像について元画像と90/180/270度回転画像を `output/<クラス>/` へ保存
pub fn augment_directory(input: &Path, output: &Path) -> Result<AugmentReport> {
    let labels = ClassLabels::discover(input)?;
    let mut report = AugmentReport::default();

    for class_name in labels.as_slice() {
        let class_out = output.join(class_name);
        std::fs::create_dir_all(&class_out)
            .with_context(|| format!("ディレクトリを作成できません: {}", class_out.display()))?;
        info!("処理中のクラス: {}", class_name);

        let mut files: Vec<_> = std::fs::read_dir(input.join(class_name))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image_file(path))
            .collect();
        files.sort();

        for path in files {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let original = match image::open(&path) {
                Ok(img) => img,
                Err(e) => {
                    warn!("画像を読み込めません {}: {}", path.display(), e);
                    report.skipped.push(path.display().to_string());
                    continue;
                }
            };

            let variants = [
                ("original", original.clone()),
                ("rotated_90", original.rotate90()),
                ("rotated_180", original.rotate180()),
                ("rotated_270", original.rotate270()),
            ];
            for (prefix, img) in variants {
                let dest = class_out.join(format!("{}_{}", prefix, file_name));
                img.save(&dest)
                    .with_context(|| format!("保存に失敗しました: {}", dest.display()))?;
            }
            report.processed += 1;
        }
    }

    info!(
        "回転拡張が完了しました: {} 枚処理 / {} 枚スキップ",
        report.processed,
        report.skipped.len()
    );
    Ok(report)
}

/// 学習時のランダム拡張
#[derive(Debug, Clone, Copy)]
pub struct Augmenter {
    /// 左右反転の確率
    pub flip_probability: f64,
    /// 90度単位の回転を行うか
    pub quarter_turns: bool,
}

impl Default for Augmenter {
    fn default() -> Self {
        Self {
            flip_probability: 0.5,
            quarter_turns: true,
        }
    }
}

impl Augmenter {
    pub fn apply<R: Rng + ?Sized>(&self, image: DynamicImage, rng: &mut R) -> DynamicImage {
        let image = if rng.gen_bool(self.flip_probability) {
            image.fliph()
        } else {
            image
        };

        if !self.quarter_turns {
            return image;
        }
        match rng.gen_range(0..4) {
            1 => image.rotate90(),
            2 => image.rotate180(),
            3 => image.rotate270(),
            _ => image,
        }
    }
}
