//! 確率分布から分類結果への変換

use serde::Serialize;

use crate::error::ClassifyError;

/// 信頼度しきい値のデフォルト
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.6;

/// 1枚の画像に対する分類結果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// しきい値を超えたクラス
    Classified {
        label: String,
        index: usize,
        confidence: f32,
    },
    /// 最大確率がしきい値以下
    Unclassified { confidence: f32 },
    /// 参照画像との類似度ゲートで棄却（分類器は呼ばれていない）
    NoReferenceMatch { best_score: f32 },
}

impl Outcome {
    pub fn label(&self) -> Option<&str> {
        match self {
            Outcome::Classified { label, .. } => Some(label),
            _ => None,
        }
    }

    pub fn is_classified(&self) -> bool {
        matches!(self, Outcome::Classified { .. })
    }
}

/// 最大値のインデックスと値
///
/// NaN は最大値として扱いません。全要素が NaN の場合は `None`。
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best, (i, v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
}

/// arg-max としきい値で分類結果を決める
///
/// 出力の次元がラベル数と異なる場合はエラーにし、範囲外のラベルを作りません。
pub fn decide(
    probabilities: &[f32],
    labels: &[String],
    threshold: f32,
) -> Result<Outcome, ClassifyError> {
    if probabilities.len() != labels.len() {
        return Err(ClassifyError::OutputMismatch {
            expected: labels.len(),
            actual: probabilities.len(),
        });
    }

    let (index, confidence) = argmax(probabilities).ok_or(ClassifyError::OutputMismatch {
        expected: labels.len(),
        actual: 0,
    })?;

    if confidence > threshold {
        Ok(Outcome::Classified {
            label: labels[index].clone(),
            index,
            confidence,
        })
    } else {
        Ok(Outcome::Unclassified { confidence })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rice_labels() -> Vec<String> {
        vec!["Basmati".to_string(), "Jasmine".to_string(), "Arborio".to_string()]
    }

    #[test]
    fn test_confident_jasmine() {
        let outcome = decide(&[0.10, 0.82, 0.08], &rice_labels(), 0.6).unwrap();
        assert_eq!(
            outcome,
            Outcome::Classified {
                label: "Jasmine".to_string(),
                index: 1,
                confidence: 0.82,
            }
        );
    }

    #[test]
    fn test_low_confidence_is_unclassified() {
        for probs in [[0.41, 0.30, 0.29], [0.30, 0.41, 0.29], [0.29, 0.30, 0.41]] {
            let outcome = decide(&probs, &rice_labels(), 0.6).unwrap();
            assert_eq!(outcome, Outcome::Unclassified { confidence: 0.41 });
            assert_eq!(outcome.label(), None);
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let outcome = decide(&[0.6, 0.3, 0.1], &rice_labels(), 0.6).unwrap();
        assert!(!outcome.is_classified());
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = decide(&[0.2, 0.8], &rice_labels(), 0.6).unwrap_err();
        assert!(matches!(err, ClassifyError::OutputMismatch { expected: 3, actual: 2 }));

        let err = decide(&[0.1, 0.1, 0.1, 0.7], &rice_labels(), 0.6).unwrap_err();
        assert!(matches!(err, ClassifyError::OutputMismatch { expected: 3, actual: 4 }));
    }

    #[test]
    fn test_empty_output() {
        assert!(decide(&[], &[], 0.6).is_err());
    }

    #[test]
    fn test_argmax_ignores_nan() {
        assert_eq!(argmax(&[f32::NAN, 0.2, 0.7]), Some((2, 0.7)));
        assert_eq!(argmax(&[f32::NAN]), None);
        // 同値は先頭を優先
        assert_eq!(argmax(&[0.5, 0.5]), Some((0, 0.5)));
    }
}
