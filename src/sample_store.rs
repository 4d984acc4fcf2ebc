//! 生サンプルの保存と命名規則
//!
//! サンプルは `<正規ラベル>_<連番>.<拡張子>` の形式でフラットなディレクトリに保存されます。
//! ラベル自体にアンダースコアを含むことがある（`num_7`, `mult_x`）ため、
//! ファイル名は最後のアンダースコアで分割します。

use std::path::{Path, PathBuf};

use image::DynamicImage;

use crate::error::{RecognizerError, Result};
use crate::labels::{is_storable_label, normalize};

/// 学習サンプルとして扱う拡張子
pub const SAMPLE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// ファイル名から (正規ラベル, 連番) を取り出す
///
/// 命名規則に従わない場合は `None`
pub fn parse_sample_name(file_name: &str) -> Option<(String, u64)> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if !is_sample_extension(ext) {
        return None;
    }

    let (label, index) = stem.rsplit_once('_')?;
    if !is_storable_label(label) || index.is_empty() || !index.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let index = index.parse().ok()?;
    Some((label.to_string(), index))
}

pub fn is_sample_extension(ext: &str) -> bool {
    let ext = ext.to_ascii_lowercase();
    SAMPLE_EXTENSIONS.contains(&ext.as_str())
}

/// サンプル保存先ディレクトリ
#[derive(Debug, Clone)]
pub struct SampleStore {
    root: PathBuf,
}

impl SampleStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 指定ラベルの次の連番（既存の最大連番 + 1、連番は連続している必要はない）
    pub fn next_index(&self, label: &str) -> Result<u64> {
        if !self.root.exists() {
            return Ok(0);
        }

        let mut next = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((existing, index)) = parse_sample_name(name) {
                if existing == label {
                    next = next.max(index + 1);
                }
            }
        }
        Ok(next)
    }

    /// 生ラベルを正規化し、命名規則に従ったPNGとして画像を保存する
    pub fn save(&self, raw_label: &str, image: &DynamicImage) -> Result<PathBuf> {
        let label = normalize(raw_label);
        if !is_storable_label(&label) {
            return Err(RecognizerError::Configuration(format!(
                "label {raw_label:?} normalizes to {label:?}, which cannot be stored \
                 (only ASCII letters, digits and '_' are allowed)"
            )));
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(RecognizerError::Configuration(
                "refusing to store an empty bitmap".into(),
            ));
        }

        std::fs::create_dir_all(&self.root)?;
        let index = self.next_index(&label)?;
        let path = self.root.join(format!("{label}_{index}.png"));
        image.save_with_format(&path, image::ImageFormat::Png)?;

        tracing::info!(label = %label, path = %path.display(), "sample stored");
        Ok(path)
    }
}
