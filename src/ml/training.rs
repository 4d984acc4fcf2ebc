//! モデル学習
//!
//! Autodiff バックエンド上で Adam による学習を行い、エポックごとに検証損失を監視して
//! 改善が止まったら学習率を下げます（早期終了は行わず、常に指定エポック数を実行）。

use std::path::Path;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{RecognizerError, Result};
use crate::labels::LabelMap;
use crate::ml::augmentation::Augmenter;
use crate::ml::dataset::{DatasetBuilder, DatasetSplit, SymbolDataset, SymbolItem};
use crate::ml::ml_model::{
    argmax_first, tensor_to_vec, SymbolClassifier, SymbolClassifierConfig, IMAGE_SIZE,
};
use crate::model::config::{AppConfig, AugmentationSettings, TrainingSettings};
use crate::model::{save_model, ModelMetadata};

/// バッチャー
#[derive(Clone, Debug)]
pub struct SymbolBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> SymbolBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct SymbolBatch<B: Backend> {
    /// [batch_size, 1, 28, 28]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, SymbolItem, SymbolBatch<B>> for SymbolBatcher<B> {
    fn batch(&self, items: Vec<SymbolItem>, _device: &B::Device) -> SymbolBatch<B> {
        let batch_size = items.len();
        let mut pixels = Vec::with_capacity(batch_size * IMAGE_SIZE * IMAGE_SIZE);
        let mut targets = Vec::with_capacity(batch_size);

        for item in items {
            pixels.extend_from_slice(&item.pixels);
            targets.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([batch_size, 1, IMAGE_SIZE, IMAGE_SIZE]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        SymbolBatch { images, targets }
    }
}

/// 1エポック分の学習結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1始まりのエポック番号
    pub epoch: usize,
    /// このエポックで使用した学習率
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train_accuracy: f64,
    /// 検証データが空の場合は `None`
    pub valid_loss: Option<f64>,
    pub valid_accuracy: Option<f64>,
}

/// 検証損失の停滞で学習率を下げるスケジュール
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlateauSchedule {
    pub factor: f64,
    pub patience: usize,
    pub min_learning_rate: f64,
    pub min_delta: f64,
}

impl From<&TrainingSettings> for PlateauSchedule {
    fn from(settings: &TrainingSettings) -> Self {
        Self {
            factor: settings.lr_factor,
            patience: settings.lr_patience,
            min_learning_rate: settings.min_learning_rate,
            min_delta: settings.lr_min_delta,
        }
    }
}

/// 学習中の状態（永続化しない）
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// 完了したエポック数
    pub epoch: usize,
    pub learning_rate: f64,
    pub best_val_loss: f64,
    /// 改善のない連続エポック数
    pub wait: usize,
    schedule: PlateauSchedule,
}

impl TrainingState {
    pub fn new(learning_rate: f64, schedule: PlateauSchedule) -> Self {
        Self {
            epoch: 0,
            learning_rate,
            best_val_loss: f64::INFINITY,
            wait: 0,
            schedule,
        }
    }

    /// エポック終了時に検証損失を記録し、次のエポックで使う学習率を返す
    pub fn end_epoch(&mut self, val_loss: f64) -> f64 {
        self.epoch += 1;

        if val_loss < self.best_val_loss - self.schedule.min_delta {
            self.best_val_loss = val_loss;
            self.wait = 0;
            return self.learning_rate;
        }

        self.wait += 1;
        if self.wait >= self.schedule.patience {
            let reduced = (self.learning_rate * self.schedule.factor)
                .max(self.schedule.min_learning_rate);
            if reduced < self.learning_rate {
                tracing::info!(
                    epoch = self.epoch,
                    from = self.learning_rate,
                    to = reduced,
                    "validation loss plateaued, reducing learning rate"
                );
                self.learning_rate = reduced;
            }
            self.wait = 0;
        }
        self.learning_rate
    }
}

/// 学習結果（推論用バックエンド上の凍結済みモデルと履歴）
#[derive(Debug)]
pub struct TrainingOutcome<B: Backend> {
    pub model: SymbolClassifier<B>,
    pub history: Vec<EpochMetrics>,
}

/// 損失・正解数の集計
#[derive(Default)]
struct RunningMetrics {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl RunningMetrics {
    fn add<B: Backend>(
        &mut self,
        loss: Tensor<B, 1>,
        logits: Tensor<B, 2>,
        targets: &[usize],
    ) -> Result<()> {
        let batch_size = targets.len();
        let loss: f64 = loss.into_scalar().elem::<f64>();
        self.loss_sum += loss * batch_size as f64;
        self.samples += batch_size;

        let [_, num_classes] = logits.dims();
        let logits = tensor_to_vec(logits)?;
        self.correct += logits
            .chunks(num_classes)
            .zip(targets)
            .filter(|(row, target)| argmax_first(row) == Some(**target))
            .count();
        Ok(())
    }

    fn loss(&self) -> f64 {
        self.loss_sum / self.samples.max(1) as f64
    }

    fn accuracy(&self) -> f64 {
        self.correct as f64 / self.samples.max(1) as f64
    }
}

/// 分類器を学習する
///
/// 学習データは毎エポックシャッフルし、バッチごとに新しいランダム変換でデータ拡張します。
/// 検証は変換なしの検証データで推論モードのモデルを使って行います。
pub fn train_classifier<B, F>(
    split: &DatasetSplit,
    num_classes: usize,
    settings: &TrainingSettings,
    augmentation: &AugmentationSettings,
    device: &B::Device,
    mut progress: F,
) -> Result<TrainingOutcome<B::InnerBackend>>
where
    B: AutodiffBackend,
    F: FnMut(&EpochMetrics),
{
    if num_classes < 2 {
        return Err(RecognizerError::Configuration(format!(
            "at least 2 classes are required to train a classifier, found {num_classes}"
        )));
    }
    if split.train.is_empty() {
        return Err(RecognizerError::Configuration(
            "training split is empty".into(),
        ));
    }
    if settings.batch_size == 0 {
        return Err(RecognizerError::Configuration(
            "batch size must be positive".into(),
        ));
    }
    if split.valid.is_empty() {
        tracing::warn!(
            "validation split is empty, learning rate schedule will monitor training loss"
        );
    }

    B::seed(device, settings.seed);
    let mut rng = StdRng::seed_from_u64(settings.seed);

    let mut model: SymbolClassifier<B> = SymbolClassifierConfig::new(num_classes).init(device);
    tracing::info!(
        params = model.num_params(),
        num_classes,
        train = split.train.len(),
        valid = split.valid.len(),
        "starting training"
    );

    let mut optim = AdamConfig::new().with_epsilon(1e-7).init();
    let augmenter = Augmenter::new(augmentation.clone());
    let batcher_train = SymbolBatcher::<B>::new(device.clone());
    let batcher_valid = SymbolBatcher::<B::InnerBackend>::new(device.clone());

    let mut state = TrainingState::new(settings.learning_rate, PlateauSchedule::from(settings));
    let mut history = Vec::with_capacity(settings.num_epochs);
    let mut order: Vec<usize> = (0..split.train.len()).collect();

    for epoch in 1..=settings.num_epochs {
        let learning_rate = state.learning_rate;

        // 学習フェーズ
        order.shuffle(&mut rng);
        let mut train_metrics = RunningMetrics::default();
        for chunk in order.chunks(settings.batch_size) {
            let items: Vec<SymbolItem> = chunk.iter().filter_map(|&i| split.train.get(i)).collect();
            let items = augmenter.augment_batch(items, &mut rng);
            let targets: Vec<usize> = items.iter().map(|item| item.label).collect();
            let batch = batcher_train.batch(items, device);

            let output = model.forward_classification(batch.images, batch.targets);
            let grads = output.loss.backward();
            train_metrics.add(output.loss.inner(), output.output.inner(), &targets)?;

            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(learning_rate, model, grads);
        }

        // 検証フェーズ（Dropout無効、BatchNormは移動統計量）
        let valid_metrics = evaluate(
            &model.valid(),
            &split.valid,
            &batcher_valid,
            settings.batch_size,
        )?;

        let metrics = EpochMetrics {
            epoch,
            learning_rate,
            train_loss: train_metrics.loss(),
            train_accuracy: train_metrics.accuracy(),
            valid_loss: valid_metrics.as_ref().map(RunningMetrics::loss),
            valid_accuracy: valid_metrics.as_ref().map(RunningMetrics::accuracy),
        };
        tracing::info!(
            epoch,
            epochs = settings.num_epochs,
            lr = learning_rate,
            train_loss = metrics.train_loss,
            train_acc = metrics.train_accuracy,
            valid_loss = ?metrics.valid_loss,
            valid_acc = ?metrics.valid_accuracy,
            "epoch finished"
        );

        state.end_epoch(metrics.valid_loss.unwrap_or(metrics.train_loss));
        progress(&metrics);
        history.push(metrics);
    }

    tracing::info!(epochs = state.epoch, final_lr = state.learning_rate, "training complete");
    Ok(TrainingOutcome {
        model: model.valid(),
        history,
    })
}

/// 推論モードのモデルでデータセット全体を評価する（空の場合は `None`）
fn evaluate<B: Backend>(
    model: &SymbolClassifier<B>,
    dataset: &SymbolDataset,
    batcher: &SymbolBatcher<B>,
    batch_size: usize,
) -> Result<Option<RunningMetrics>> {
    if dataset.is_empty() {
        return Ok(None);
    }

    let mut metrics = RunningMetrics::default();
    for chunk in dataset.items().chunks(batch_size) {
        let targets: Vec<usize> = chunk.iter().map(|item| item.label).collect();
        let batch = batcher.batch(chunk.to_vec(), &batcher.device);
        let output = model.forward_classification(batch.images, batch.targets);
        metrics.add(output.loss, output.output, &targets)?;
    }
    Ok(Some(metrics))
}

/// 学習パイプラインの結果
#[derive(Debug)]
pub struct TrainingReport {
    pub labels: LabelMap,
    pub history: Vec<EpochMetrics>,
    pub metadata: ModelMetadata,
    pub skipped_samples: usize,
}

/// サンプルディレクトリから学習し、モデルアーカイブを書き出す
pub fn train_from_directory<B, F>(
    config: &AppConfig,
    data_dir: &Path,
    output_path: &Path,
    device: &B::Device,
    progress: F,
) -> Result<TrainingReport>
where
    B: AutodiffBackend,
    F: FnMut(&EpochMetrics),
{
    let settings = &config.training;
    let builder = DatasetBuilder::new(settings.train_ratio, settings.seed, settings.decode_policy);
    let (split, labels) = builder.build(data_dir)?;

    let outcome = train_classifier::<B, F>(
        &split,
        labels.len(),
        settings,
        &config.augmentation,
        device,
        progress,
    )?;

    let last = outcome.history.last();
    let metadata = ModelMetadata::new(
        labels.len(),
        IMAGE_SIZE,
        outcome.history.len(),
        settings.seed,
        last.and_then(|m| m.valid_loss),
        last.and_then(|m| m.valid_accuracy),
    );
    save_model(output_path, &outcome.model, &labels, &metadata)?;

    Ok(TrainingReport {
        labels,
        history: outcome.history,
        metadata,
        skipped_samples: split.skipped.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    use crate::ml::ml_model::IMAGE_PIXELS;

    /// 横棒（ラベル0）または縦棒（ラベル1）の 28x28 画像
    fn bar_item(label: usize, offset: usize) -> SymbolItem {
        let mut pixels = vec![1.0; IMAGE_PIXELS];
        for a in 4..24 {
            for b in 0..4 {
                let across = 10 + offset + b;
                let (row, col) = if label == 0 { (across, a) } else { (a, across) };
                pixels[row * IMAGE_SIZE + col] = 0.0;
            }
        }
        SymbolItem { pixels, label }
    }

    fn bar_split() -> DatasetSplit {
        let items = |offsets: &[usize]| {
            SymbolDataset::new(
                offsets
                    .iter()
                    .flat_map(|&offset| [bar_item(0, offset), bar_item(1, offset)])
                    .collect(),
            )
        };
        DatasetSplit {
            train: items(&[0, 1, 2, 3]),
            valid: items(&[1, 4]),
            skipped: Vec::new(),
        }
    }

    fn schedule() -> PlateauSchedule {
        PlateauSchedule::from(&TrainingSettings::default())
    }

    #[test]
    fn test_learning_rate_halves_after_three_flat_epochs() {
        let mut state = TrainingState::new(1e-3, schedule());

        assert_eq!(state.end_epoch(1.0), 1e-3);
        assert_eq!(state.end_epoch(1.0), 1e-3);
        assert_eq!(state.end_epoch(1.0), 1e-3);
        // 3回連続で改善なし → 4回目の停滞エポックは 0.0005 で学習する
        assert_eq!(state.end_epoch(1.0), 5e-4);
        assert_eq!(state.wait, 0);
        assert_eq!(state.epoch, 4);
    }

    #[test]
    fn test_learning_rate_never_drops_below_floor() {
        let mut state = TrainingState::new(1e-3, schedule());
        state.end_epoch(1.0);
        for _ in 0..200 {
            let lr = state.end_epoch(1.0);
            assert!(lr >= 1e-5);
        }
        assert_eq!(state.learning_rate, 1e-5);
    }

    #[test]
    fn test_improvement_resets_wait() {
        let mut state = TrainingState::new(1e-3, schedule());
        state.end_epoch(1.0);
        state.end_epoch(1.0);
        state.end_epoch(1.0);
        assert_eq!(state.wait, 2);
        state.end_epoch(0.5);
        assert_eq!(state.wait, 0);
        assert_eq!(state.best_val_loss, 0.5);
        assert_eq!(state.learning_rate, 1e-3);
    }

    #[test]
    fn test_improvement_smaller_than_min_delta_counts_as_flat() {
        let mut state = TrainingState::new(1e-3, schedule());
        state.end_epoch(1.0);
        state.end_epoch(1.0 - 5e-5);
        assert_eq!(state.wait, 1);
        assert_eq!(state.best_val_loss, 1.0);
    }

    #[test]
    fn test_validation_uses_untransformed_items() {
        let split = bar_split();
        let settings = TrainingSettings {
            num_epochs: 1,
            batch_size: 4,
            ..TrainingSettings::default()
        };
        let augmentation = AugmentationSettings {
            rotation_degrees: 180.0,
            width_shift: 0.5,
            height_shift: 0.5,
            shear: 0.5,
            zoom: 0.5,
        };
        let device = Default::default();

        let outcome = train_classifier::<Autodiff<NdArray>, _>(
            &split,
            2,
            &settings,
            &augmentation,
            &device,
            |_| {},
        )
        .unwrap();
        let last = outcome.history.last().unwrap();

        let batcher = SymbolBatcher::<NdArray>::new(device);
        let untouched = evaluate(&outcome.model, &split.valid, &batcher, settings.batch_size)
            .unwrap()
            .unwrap();
        assert_eq!(last.valid_loss, Some(untouched.loss()));
        assert_eq!(last.valid_accuracy, Some(untouched.accuracy()));

        let augmented = SymbolDataset::new(Augmenter::new(augmentation).augment_batch(
            split.valid.items().to_vec(),
            &mut StdRng::seed_from_u64(1),
        ));
        let transformed = evaluate(&outcome.model, &augmented, &batcher, settings.batch_size)
            .unwrap()
            .unwrap();
        assert_ne!(transformed.loss(), untouched.loss());
    }

    #[test]
    fn test_single_class_split_fails_before_any_epoch() {
        let split = bar_split();
        let mut epochs_seen = 0;
        let result = train_classifier::<Autodiff<NdArray>, _>(
            &split,
            1,
            &TrainingSettings::default(),
            &AugmentationSettings::default(),
            &Default::default(),
            |_| epochs_seen += 1,
        );
        assert!(matches!(result, Err(RecognizerError::Configuration(_))));
        assert_eq!(epochs_seen, 0);
    }
}
