//! テスト用の共通ヘルパー

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::preprocess::ImageTensor;
use crate::service::Classifier;

/// RGB画像をPNGにエンコード
pub fn png_bytes(img: &RgbImage) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut buffer, ImageFormat::Png)
        .unwrap();
    buffer.into_inner()
}

/// 縞模様の画像（`seed` ごとに異なる）
pub fn pattern_image(width: u32, height: u32, seed: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let v = ((x * (seed + 3) + y * (seed * 7 + 1)) % 256) as u8;
        Rgb([v, v.wrapping_mul(3), 255 - v])
    })
}

/// `root/<クラス>/img_NNN.png` を作成
pub fn write_dataset(root: &Path, classes: &[(&str, usize)]) {
    for (class_index, (name, count)) in classes.iter().enumerate() {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..*count {
            pattern_image(12, 12, (class_index * 31 + i) as u32)
                .save(dir.join(format!("img_{:03}.png", i)))
                .unwrap();
        }
    }
}

/// 固定の確率分布を返し、呼び出し回数を数える分類器
pub struct FixedClassifier {
    probabilities: Vec<f32>,
    input_size: u32,
    calls: AtomicUsize,
}

impl FixedClassifier {
    pub fn new(probabilities: Vec<f32>, input_size: u32) -> Self {
        Self {
            probabilities,
            input_size,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Classifier for FixedClassifier {
    fn num_classes(&self) -> usize {
        self.probabilities.len()
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn predict(&self, input: &ImageTensor) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(input.size() == self.input_size, "入力サイズが違います");
        Ok(self.probabilities.clone())
    }
}

/// 常に失敗する分類器
pub struct FailingClassifier {
    pub num_classes: usize,
    pub input_size: u32,
}

impl Classifier for FailingClassifier {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn predict(&self, _input: &ImageTensor) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("device lost")
    }
}
