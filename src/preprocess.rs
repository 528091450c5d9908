//! 画像の前処理
//!
//! デコード → バイリニアでリサイズ → 1/255 でスケーリング → (C, H, W) に平坦化。
//! 学習時と推論時で同じ関数を使います。

use std::path::Path;

use image::{imageops::FilterType, DynamicImage};

use crate::error::ClassifyError;

/// モデル入力サイズのデフォルト（正方形）
pub const DEFAULT_INPUT_SIZE: u32 = 224;

/// 正規化済みのRGB画像
///
/// 値は [0, 1]、並びは (C, H, W)。
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    size: u32,
    data: Vec<f32>,
}

impl ImageTensor {
    /// 一辺のピクセル数
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// バッチ次元を先頭に付けた形状 [1, 3, H, W]
    pub fn batch_shape(&self) -> [usize; 4] {
        let s = self.size as usize;
        [1, 3, s, s]
    }
}

/// バイト列から画像をデコード
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ClassifyError> {
    if bytes.is_empty() {
        return Err(ClassifyError::EmptyPayload);
    }
    Ok(image::load_from_memory(bytes)?)
}

/// ファイルから画像を読み込む
pub fn open_image(path: &Path) -> Result<DynamicImage, ClassifyError> {
    let bytes = std::fs::read(path)?;
    decode_image(&bytes)
}

/// 画像をモデル入力に変換
///
/// 任意サイズの画像を受け付け、`size`x`size` に引き伸ばします（アスペクト比は保持しない）。
pub fn to_tensor(image: &DynamicImage, size: u32) -> ImageTensor {
    let resized = image.resize_exact(size, size, FilterType::Triangle);
    ImageTensor {
        size,
        data: normalize_rgb(&resized),
    }
}

/// RGB画像を [0, 1] の (C, H, W) 配列に変換
pub fn normalize_rgb(image: &DynamicImage) -> Vec<f32> {
    let rgb = image.to_rgb8();
    let num_pixels = (rgb.width() * rgb.height()) as usize;
    let mut data = vec![0.0f32; 3 * num_pixels];

    for (i, pixel) in rgb.pixels().enumerate() {
        data[i] = pixel[0] as f32 / 255.0;
        data[num_pixels + i] = pixel[1] as f32 / 255.0;
        data[2 * num_pixels + i] = pixel[2] as f32 / 255.0;
    }

    data
}

/// 画像ファイルの拡張子判定（png / jpg / jpeg、大文字小文字を区別しない）
pub fn is_image_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_lowercase();
            ext == "png" || ext == "jpg" || ext == "jpeg"
        }
        None => false,
    }
}
