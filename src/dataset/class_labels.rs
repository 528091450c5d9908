//! クラスラベル（データセットのサブディレクトリ名）

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 順序付きクラス名
///
/// インデックスはモデル出力層の位置と一致します。学習時に決めた順序をモデルファイルへ
/// 保存し、推論時はディレクトリを読み直さずにそれを使います。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassLabels(Vec<String>);

impl ClassLabels {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    /// データセットのルートからクラス一覧を作る
    ///
    /// サブディレクトリ名を辞書順に並べます。隠しディレクトリ（`.` 始まり）は除外。
    pub fn discover(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            anyhow::bail!("データセットディレクトリが存在しません: {}", root.display());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(root)
            .with_context(|| format!("ディレクトリを読み込めません: {}", root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry
                .file_name()
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("不正なディレクトリ名: {:?}", entry.file_name()))?
                .to_string();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }

        if names.is_empty() {
            anyhow::bail!("クラスディレクトリが見つかりません: {}", root.display());
        }

        names.sort();
        Ok(Self(names))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}
