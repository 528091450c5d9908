//! 参照画像との構造的類似度（SSIM）による事前判定
//!
//! 問い合わせ画像をグレースケール・100x100に縮小し、各クラスからランダムに選んだ
//! 参照画像（最大5枚）と比較します。最良スコアがしきい値を超えない場合は分類器を
//! 呼ばずに棄却します。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use image::{imageops::FilterType, DynamicImage, GrayImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::dataset::ClassLabels;
use crate::model::MatcherSettings;
use crate::preprocess::is_image_file;

/// 定数 (K1 * L)^2, (K2 * L)^2、L = 255
const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);
/// 局所統計を取る窓の一辺
const WINDOW: u32 = 7;

/// クラスごとの参照画像パス
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    classes: BTreeMap<String, Vec<PathBuf>>,
}

impl ReferenceIndex {
    /// データセットのルートから参照画像の一覧を作る
    pub fn scan(root: &Path) -> Result<Self> {
        let labels = ClassLabels::discover(root)?;
        let mut classes = BTreeMap::new();

        for class_name in labels.as_slice() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(root.join(class_name))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| is_image_file(path))
                .collect();
            paths.sort();
            if paths.is_empty() {
                warn!("参照画像がありません: クラス '{}'", class_name);
            }
            classes.insert(class_name.clone(), paths);
        }

        Ok(Self { classes })
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

/// 照合結果
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceMatch {
    /// 最良スコアのクラス（参照画像が1枚も読めなかった場合は `None`）
    pub class_name: Option<String>,
    pub score: f32,
    /// しきい値を超えたか
    pub accepted: bool,
}

/// SSIMによる参照画像照合
pub struct ReferenceMatcher {
    index: ReferenceIndex,
    samples_per_class: usize,
    image_size: u32,
    threshold: f32,
    rng: Mutex<StdRng>,
}

impl ReferenceMatcher {
    pub fn new(index: ReferenceIndex, settings: &MatcherSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            index,
            samples_per_class: settings.samples_per_class,
            image_size: settings.image_size,
            threshold: settings.threshold,
            rng: Mutex::new(rng),
        }
    }

    /// 設定のディレクトリを走査して作成
    pub fn from_settings(settings: &MatcherSettings) -> Result<Self> {
        let index = ReferenceIndex::scan(&settings.dataset_dir)?;
        Ok(Self::new(index, settings))
    }

    pub fn index(&self) -> &ReferenceIndex {
        &self.index
    }

    /// 比較用にグレースケール・固定サイズへ変換
    pub fn prepare(&self, image: &DynamicImage) -> GrayImage {
        image
            .resize_exact(self.image_size, self.image_size, FilterType::Triangle)
            .to_luma8()
    }

    /// 最も似ている参照画像のクラスを探す
    pub fn best_match(&self, image: &DynamicImage) -> ReferenceMatch {
        let query = self.prepare(image);
        let sampled = self.sample_references();

        let mut best: Option<(String, f32)> = None;
        for (class_name, path) in sampled {
            let reference = match image::open(&path) {
                Ok(img) => self.prepare(&img),
                Err(e) => {
                    warn!("参照画像を読み込めません {}: {}", path.display(), e);
                    continue;
                }
            };
            let score = ssim(&query, &reference) as f32;
            debug!("SSIM {:.4} ({}: {})", score, class_name, path.display());

            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((class_name, score));
            }
        }

        match best {
            Some((class_name, score)) => ReferenceMatch {
                class_name: Some(class_name),
                score,
                accepted: score > self.threshold,
            },
            None => ReferenceMatch {
                class_name: None,
                score: 0.0,
                accepted: false,
            },
        }
    }

    /// クラスごとに最大 `samples_per_class` 枚を無作為に選ぶ
    fn sample_references(&self) -> Vec<(String, PathBuf)> {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut sampled = Vec::new();
        for (class_name, paths) in &self.index.classes {
            for path in paths.choose_multiple(&mut *rng, self.samples_per_class) {
                sampled.push((class_name.clone(), path.clone()));
            }
        }
        sampled
    }
}

/// 2枚の同サイズのグレースケール画像の平均SSIM
///
/// 7x7 の一様窓を1ピクセルずつずらし、各窓のSSIMを平均します。
/// 画像が窓より小さい場合は画像全体を1つの窓として扱います。サイズが異なる画像は 0.0。
pub fn ssim(a: &GrayImage, b: &GrayImage) -> f64 {
    let (width, height) = a.dimensions();
    if a.dimensions() != b.dimensions() || width == 0 || height == 0 {
        return 0.0;
    }

    let win_w = WINDOW.min(width);
    let win_h = WINDOW.min(height);
    let mut total = 0.0;
    let mut count = 0usize;

    for y0 in 0..=(height - win_h) {
        for x0 in 0..=(width - win_w) {
            total += window_ssim(a, b, x0, y0, win_w, win_h);
            count += 1;
        }
    }

    total / count as f64
}

fn window_ssim(a: &GrayImage, b: &GrayImage, x0: u32, y0: u32, w: u32, h: u32) -> f64 {
    let n = (w * h) as f64;
    let (mut sum_a, mut sum_b) = (0.0, 0.0);
    let (mut sum_aa, mut sum_bb, mut sum_ab) = (0.0, 0.0, 0.0);

    for y in y0..y0 + h {
        for x in x0..x0 + w {
            let va = a.get_pixel(x, y)[0] as f64;
            let vb = b.get_pixel(x, y)[0] as f64;
            sum_a += va;
            sum_b += vb;
            sum_aa += va * va;
            sum_bb += vb * vb;
            sum_ab += va * vb;
        }
    }

    let mean_a = sum_a / n;
    let mean_b = sum_b / n;
    let var_a = (sum_aa / n - mean_a * mean_a).max(0.0);
    let var_b = (sum_bb / n - mean_b * mean_b).max(0.0);
    let cov = sum_ab / n - mean_a * mean_b;

    ((2.0 * mean_a * mean_b + C1) * (2.0 * cov + C2))
        / ((mean_a * mean_a + mean_b * mean_b + C1) * (var_a + var_b + C2))
}
