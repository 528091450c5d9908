//! データセットを train / val / test ディレクトリへ分割コピーする

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::info;

use super::class_labels::ClassLabels;
use crate::preprocess::is_image_file;

/// 分割比率（合計 1.0）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.8,
            val: 0.1,
            test: 0.1,
        }
    }
}

impl SplitRatios {
    fn validate(&self) -> Result<()> {
        let sum = self.train + self.val + self.test;
        if self.train <= 0.0 || self.val < 0.0 || self.test < 0.0 || (sum - 1.0).abs() > 1e-6 {
            anyhow::bail!(
                "分割比率が不正です: {} / {} / {} (合計 {})",
                self.train,
                self.val,
                self.test,
                sum
            );
        }
        Ok(())
    }
}

/// 分割結果の枚数
#[derive(Debug, Default, Clone, Serialize)]
pub struct SplitReport {
    pub train: usize,
    pub val: usize,
    pub test: usize,
}

/// クラスごとにシャッフルして `output/{train,val,test}/<クラス>/` へコピー
///
/// クラス単位で比率を適用するため、各分割のクラス構成が元と揃います。
pub fn split_directory(
    input: &Path,
    output: &Path,
    ratios: SplitRatios,
    seed: u64,
) -> Result<SplitReport> {
    ratios.validate()?;
    let labels = ClassLabels::discover(input)?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut report = SplitReport::default();

    for class_name in labels.as_slice() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(input.join(class_name))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image_file(path))
            .collect();
        files.sort();
        files.shuffle(&mut rng);

        let total = files.len();
        let train_len = (total as f64 * ratios.train) as usize;
        let val_len = (total as f64 * ratios.val) as usize;

        for (i, file) in files.iter().enumerate() {
            let (part, counter) = if i < train_len {
                ("train", &mut report.train)
            } else if i < train_len + val_len {
                ("val", &mut report.val)
            } else {
                ("test", &mut report.test)
            };

            let dest_dir = output.join(part).join(class_name);
            std::fs::create_dir_all(&dest_dir)
                .with_context(|| format!("ディレクトリを作成できません: {}", dest_dir.display()))?;
            let file_name = file
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("不正なファイル名: {}", file.display()))?;
            std::fs::copy(file, dest_dir.join(file_name))
                .with_context(|| format!("コピーに失敗しました: {}", file.display()))?;
            *counter += 1;
        }

        info!("  クラス '{}': {} 枚を分割しました", class_name, total);
    }

    info!(
        "分割完了: 学習 {} / 検証 {} / テスト {} → {}",
        report.train,
        report.val,
        report.test,
        output.display()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_dataset;

    #[test]
    fn test_split_counts_per_class() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_dataset(input.path(), &[("Basmati", 10), ("Jasmine", 20)]);

        let report = split_directory(input.path(), output.path(), SplitRatios::default(), 42).unwrap();
        assert_eq!(report.train, 8 + 16);
        assert_eq!(report.val, 1 + 2);
        assert_eq!(report.test, 1 + 2);

        let count = |part: &str, class: &str| {
            std::fs::read_dir(output.path().join(part).join(class)).unwrap().count()
        };
        assert_eq!(count("train", "Jasmine"), 16);
        assert_eq!(count("val", "Basmati"), 1);
        assert_eq!(count("test", "Jasmine"), 2);
    }

    #[test]
    fn test_split_is_reproducible() {
        let input = tempfile::tempdir().unwrap();
        write_dataset(input.path(), &[("A", 10)]);
        let out1 = tempfile::tempdir().unwrap();
        let out2 = tempfile::tempdir().unwrap();

        split_directory(input.path(), out1.path(), SplitRatios::default(), 7).unwrap();
        split_directory(input.path(), out2.path(), SplitRatios::default(), 7).unwrap();

        let names = |root: &Path| {
            let mut v: Vec<_> = std::fs::read_dir(root.join("val").join("A"))
                .unwrap()
                .map(|e| e.unwrap().file_name())
                .collect();
            v.sort();
            v
        };
        assert_eq!(names(out1.path()), names(out2.path()));
    }

    #[test]
    fn test_invalid_ratios() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_dataset(input.path(), &[("A", 2)]);
        let ratios = SplitRatios {
            train: 0.7,
            val: 0.1,
            test: 0.1,
        };
        assert!(split_directory(input.path(), output.path(), ratios, 42).is_err());
    }
}
