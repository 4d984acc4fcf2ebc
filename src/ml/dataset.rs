//! サンプルディレクトリからの学習データセット構築
//!
//! `<label>_<index>.<ext>` 形式のファイルを読み込み、28x28 のグレースケール画素列と
//! クラスインデックスの組に変換したうえで、固定シードで学習用/検証用に分割します。

use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{RecognizerError, Result};
use crate::labels::LabelMap;
use crate::ml::ml_model::load_and_normalize_image;
use crate::model::config::DecodePolicy;
use crate::sample_store::parse_sample_name;

/// データセットアイテム（正規化済み画素とクラスID）
#[derive(Clone, Debug, PartialEq)]
pub struct SymbolItem {
    /// [0, 1] の画素値（行優先、784要素）
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// メモリ上に保持するデータセット
#[derive(Clone, Debug, Default)]
pub struct SymbolDataset {
    items: Vec<SymbolItem>,
}

impl SymbolDataset {
    pub fn new(items: Vec<SymbolItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[SymbolItem] {
        &self.items
    }

    /// クラスごとのサンプル数
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for item in &self.items {
            if let Some(count) = counts.get_mut(item.label) {
                *count += 1;
            }
        }
        counts
    }
}

impl Dataset<SymbolItem> for SymbolDataset {
    fn get(&self, index: usize) -> Option<SymbolItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// 構築結果（学習用・検証用の分割とスキップしたファイル）
#[derive(Debug)]
pub struct DatasetSplit {
    pub train: SymbolDataset,
    pub valid: SymbolDataset,
    pub skipped: Vec<PathBuf>,
}

/// データセット構築の設定
#[derive(Debug, Clone)]
pub struct DatasetBuilder {
    train_ratio: f32,
    seed: u64,
    decode_policy: DecodePolicy,
}

impl Default for DatasetBuilder {
    fn default() -> Self {
        Self {
            train_ratio: 0.8,
            seed: 42,
            decode_policy: DecodePolicy::Skip,
        }
    }
}

impl DatasetBuilder {
    pub fn new(train_ratio: f32, seed: u64, decode_policy: DecodePolicy) -> Self {
        Self {
            train_ratio,
            seed,
            decode_policy,
        }
    }

    /// ディレクトリからデータセットとラベルマップを構築する
    pub fn build(&self, dir: &Path) -> Result<(DatasetSplit, LabelMap)> {
        if !(0.0..=1.0).contains(&self.train_ratio) {
            return Err(RecognizerError::Configuration(format!(
                "train ratio must be within [0, 1], got {}",
                self.train_ratio
            )));
        }

        let samples = scan_directory(dir)?;
        let label_map = LabelMap::from_labels(samples.iter().map(|(_, label)| label.clone()));
        tracing::info!(
            dir = %dir.display(),
            files = samples.len(),
            classes = label_map.len(),
            "scanned sample directory"
        );

        let mut items = Vec::with_capacity(samples.len());
        let mut skipped = Vec::new();
        for (path, label) in samples {
            let Some(index) = label_map.index_of(&label) else {
                continue;
            };
            match load_and_normalize_image(&path) {
                Ok(pixels) => items.push(SymbolItem {
                    pixels,
                    label: index,
                }),
                Err(e) if e.is_recoverable() && self.decode_policy == DecodePolicy::Skip => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping undecodable sample"
                    );
                    skipped.push(path);
                }
                Err(e) => return Err(e),
            }
        }

        if items.is_empty() {
            return Err(RecognizerError::Configuration(format!(
                "no decodable samples in {}",
                dir.display()
            )));
        }

        let dataset = SymbolDataset::new(items);
        let counts = dataset.class_counts(label_map.len());
        for (index, count) in counts.iter().enumerate() {
            tracing::info!(
                class = index,
                label = label_map.label_of(index).unwrap_or_default(),
                samples = count,
                "class summary"
            );
        }

        // スキップ後に残ったクラスで判定する（ラベルマップは全ファイルから作る）
        let present = counts.iter().filter(|&&count| count > 0).count();
        if present < 2 {
            return Err(RecognizerError::Configuration(format!(
                "at least 2 classes with decodable samples are required, found {present} \
                 ({} skipped as undecodable)",
                skipped.len()
            )));
        }

        let (train, valid) = self.split(dataset);
        tracing::info!(
            train = train.len(),
            valid = valid.len(),
            skipped = skipped.len(),
            "dataset ready"
        );

        Ok((
            DatasetSplit {
                train,
                valid,
                skipped,
            },
            label_map,
        ))
    }

    /// 固定シードでシャッフルし、先頭 ceil(n * (1 - train_ratio)) 件を検証用にする
    pub fn split(&self, dataset: SymbolDataset) -> (SymbolDataset, SymbolDataset) {
        let mut items = dataset.items;
        let mut rng = StdRng::seed_from_u64(self.seed);
        items.shuffle(&mut rng);

        let total = items.len();
        let valid_len = ((total as f64) * (1.0 - self.train_ratio as f64)).ceil() as usize;
        let valid_len = valid_len.min(total);

        let train = items.split_off(valid_len);
        (SymbolDataset::new(train), SymbolDataset::new(items))
    }
}

/// 命名規則に従うファイルを (パス, ラベル) としてファイル名順に列挙する
///
/// 隠しファイルは無視し、サブディレクトリは警告のうえスキップする。
/// 命名規則に従わないファイルが1つでもあればエラー。
fn scan_directory(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    if !dir.is_dir() {
        return Err(RecognizerError::Configuration(format!(
            "sample directory {} does not exist",
            dir.display()
        )));
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut samples = Vec::new();
    let mut invalid = Vec::new();
    for entry in entries {
        let path = entry.path();
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if name.starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            tracing::warn!(path = %path.display(), "ignoring subdirectory in sample directory");
            continue;
        }

        match file_name.to_str().and_then(parse_sample_name) {
            Some((label, _)) => samples.push((path, label)),
            None => invalid.push(name.into_owned()),
        }
    }

    if !invalid.is_empty() {
        return Err(RecognizerError::NamingConvention { files: invalid });
    }
    if samples.is_empty() {
        return Err(RecognizerError::Configuration(format!(
            "no samples found in {}",
            dir.display()
        )));
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn write_sample(dir: &Path, name: &str, value: u8) {
        GrayImage::from_pixel(40, 40, Luma([value]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_label_map_is_derived_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "plus_0.png", 255);
        write_sample(dir.path(), "plus_1.png", 255);
        write_sample(dir.path(), "minus_0.png", 0);

        let (split, labels) = DatasetBuilder::default().build(dir.path()).unwrap();
        assert_eq!(labels.index_of("minus"), Some(0));
        assert_eq!(labels.index_of("plus"), Some(1));
        assert_eq!(split.train.len() + split.valid.len(), 3);

        for item in split.train.items().iter().chain(split.valid.items()) {
            assert_eq!(item.pixels.len(), crate::ml::ml_model::IMAGE_PIXELS);
            assert!(item.pixels.iter().all(|v| (0.0..=1.0).contains(v)));
            let expected = if item.label == 0 { 0.0 } else { 1.0 };
            assert!(item.pixels.iter().all(|&v| (v - expected).abs() < 1e-6));
        }
    }

    #[test]
    fn test_split_is_reproducible_for_a_seed() {
        let items: Vec<SymbolItem> = (0..10)
            .map(|i| SymbolItem {
                pixels: vec![i as f32],
                label: i % 2,
            })
            .collect();
        let builder = DatasetBuilder::new(0.8, 42, DecodePolicy::Skip);

        let (train_a, valid_a) = builder.split(SymbolDataset::new(items.clone()));
        let (train_b, valid_b) = builder.split(SymbolDataset::new(items));

        assert_eq!(train_a.len(), 8);
        assert_eq!(valid_a.len(), 2);
        assert_eq!(train_a.items(), train_b.items());
        assert_eq!(valid_a.items(), valid_b.items());
    }

    #[test]
    fn test_naming_violations_fail_loudly() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "plus_0.png", 255);
        write_sample(dir.path(), "plus.png", 255);
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), "").unwrap();

        match DatasetBuilder::default().build(dir.path()) {
            Err(RecognizerError::NamingConvention { files }) => {
                assert_eq!(files, vec!["notes.txt".to_string(), "plus.png".to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_empty_or_missing_directory_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            DatasetBuilder::default().build(dir.path()),
            Err(RecognizerError::Configuration(_))
        ));
        assert!(matches!(
            DatasetBuilder::default().build(&dir.path().join("missing")),
            Err(RecognizerError::Configuration(_))
        ));
    }

    #[test]
    fn test_class_left_without_decodable_samples_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write_sample(dir.path(), &format!("plus_{i}.png"), 255);
        }
        std::fs::write(dir.path().join("minus_0.png"), b"corrupt").unwrap();

        match DatasetBuilder::default().build(dir.path()) {
            Err(RecognizerError::Configuration(msg)) => assert!(msg.contains("found 1")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_single_class_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "plus_0.png", 255);
        write_sample(dir.path(), "plus_1.png", 255);

        assert!(matches!(
            DatasetBuilder::default().build(dir.path()),
            Err(RecognizerError::Configuration(_))
        ));
    }

    #[test]
    fn test_decode_policy_skip_and_abort() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "plus_0.png", 255);
        write_sample(dir.path(), "minus_0.png", 0);
        std::fs::write(dir.path().join("minus_1.png"), b"not an image").unwrap();

        let (split, labels) = DatasetBuilder::default().build(dir.path()).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(split.skipped.len(), 1);
        assert_eq!(split.train.len() + split.valid.len(), 2);

        let strict = DatasetBuilder::new(0.8, 42, DecodePolicy::Abort);
        assert!(matches!(
            strict.build(dir.path()),
            Err(RecognizerError::SampleDecode { .. })
        ));
    }
}
