//! モデル推論機能
//!
//! 読み込んだモデルとラベルマップを保持する推論コンテキストです。
//! 読み込み後はどちらも変更されないため、`clone()` したエンジンを呼び出し元ごとに
//! 持たせればロックなしで並行に推論できます（重みのストレージは共有されます）。

use std::path::Path;
use std::sync::Arc;

use burn::tensor::{backend::Backend, Tensor};
use image::DynamicImage;

use crate::error::{RecognizerError, Result};
use crate::labels::LabelMap;
use crate::ml::ml_model::{
    argmax_first, normalize_image, tensor_to_vec, SymbolClassifier, IMAGE_SIZE,
};
use crate::model::{load_model, ModelMetadata};

/// 1枚の画像に対する推論結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub index: usize,
    pub label: String,
    /// 選ばれたクラスの確率
    pub confidence: f32,
    /// 全クラスの確率（合計1）
    pub probabilities: Vec<f32>,
}

/// 推論エンジン
#[derive(Debug, Clone)]
pub struct InferenceEngine<B: Backend> {
    model: SymbolClassifier<B>,
    labels: Arc<LabelMap>,
    metadata: Option<Arc<ModelMetadata>>,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルアーカイブを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: &B::Device) -> Result<Self> {
        let (model, labels, metadata) = load_model::<B>(model_path.as_ref(), device)?;
        Ok(Self {
            model,
            labels: Arc::new(labels),
            metadata: Some(Arc::new(metadata)),
            device: device.clone(),
        })
    }

    /// 推論モードのモデルとラベルマップから作成
    pub fn from_parts(
        model: SymbolClassifier<B>,
        labels: LabelMap,
        device: &B::Device,
    ) -> Result<Self> {
        if model.num_classes() != labels.len() {
            return Err(RecognizerError::ArtifactMismatch {
                model_classes: model.num_classes(),
                label_classes: labels.len(),
            });
        }
        Ok(Self {
            model,
            labels: Arc::new(labels),
            metadata: None,
            device: device.clone(),
        })
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn metadata(&self) -> Option<&ModelMetadata> {
        self.metadata.as_deref()
    }

    /// 単一画像を分類し、正規ラベルを返す
    pub fn predict(&self, image: &DynamicImage) -> Result<String> {
        Ok(self.predict_detailed(image)?.label)
    }

    /// 単一画像を分類し、確率を含む結果を返す
    pub fn predict_detailed(&self, image: &DynamicImage) -> Result<Prediction> {
        let pixels = normalize_image(image)?;
        let probabilities = self.probabilities(&pixels, 1)?;
        self.decode(probabilities)
    }

    /// 複数画像を順に分類（1枚でも失敗すればエラー）
    pub fn predict_batch(&self, images: &[DynamicImage]) -> Result<Vec<Prediction>> {
        images.iter().map(|image| self.predict_detailed(image)).collect()
    }

    /// 正規化済み画素列（[0, 1]、784要素 × 枚数）からクラス確率を計算
    pub fn probabilities(&self, pixels: &[f32], count: usize) -> Result<Vec<f32>> {
        if count == 0 || pixels.len() != count * IMAGE_SIZE * IMAGE_SIZE {
            return Err(RecognizerError::InferenceInput(format!(
                "expected {count} image(s) of {IMAGE_SIZE}x{IMAGE_SIZE} pixels, got {} values",
                pixels.len()
            )));
        }

        // Tensorに変換 [count, 1, 28, 28]
        let tensor = Tensor::<B, 1>::from_floats(pixels, &self.device)
            .reshape([count, 1, IMAGE_SIZE, IMAGE_SIZE]);
        tensor_to_vec(self.model.probabilities(tensor))
    }

    fn decode(&self, probabilities: Vec<f32>) -> Result<Prediction> {
        let index = argmax_first(&probabilities).ok_or_else(|| {
            RecognizerError::InferenceInput("model produced no finite probabilities".into())
        })?;
        let label = self
            .labels
            .label_of(index)
            .ok_or_else(|| {
                RecognizerError::ArtifactMismatch {
                    model_classes: probabilities.len(),
                    label_classes: self.labels.len(),
                }
            })?
            .to_string();

        Ok(Prediction {
            index,
            label,
            confidence: probabilities[index],
            probabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{GrayImage, Luma};

    use crate::ml::ml_model::SymbolClassifierConfig;

    type TestBackend = NdArray;

    fn engine() -> InferenceEngine<TestBackend> {
        let device = Default::default();
        let model = SymbolClassifierConfig::new(3).init::<TestBackend>(&device);
        InferenceEngine::from_parts(model, LabelMap::from_labels(["div", "minus", "plus"]), &device)
            .unwrap()
    }

    #[test]
    fn test_prediction_is_a_known_label() {
        let engine = engine();
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(400, 200, Luma([255u8])));

        let prediction = engine.predict_detailed(&image).unwrap();
        assert!(prediction.index < 3);
        assert_eq!(engine.labels().label_of(prediction.index), Some(prediction.label.as_str()));
        let sum: f32 = prediction.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert_eq!(engine.predict(&image).unwrap(), prediction.label);
    }

    #[test]
    fn test_inference_is_repeatable() {
        let engine = engine();
        let image = DynamicImage::ImageLuma8(GrayImage::from_fn(64, 64, |x, y| {
            Luma([if (x + y) % 7 == 0 { 0 } else { 255 }])
        }));
        let first = engine.predict_detailed(&image).unwrap();
        for _ in 0..5 {
            assert_eq!(engine.predict_detailed(&image).unwrap(), first);
        }
    }

    #[test]
    fn test_invalid_input_leaves_engine_usable() {
        let engine = engine();
        let empty = DynamicImage::ImageLuma8(GrayImage::new(0, 0));
        assert!(matches!(
            engine.predict(&empty),
            Err(RecognizerError::InferenceInput(_))
        ));

        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(28, 28, Luma([128u8])));
        assert!(engine.predict(&image).is_ok());
        assert!(matches!(
            engine.probabilities(&[0.0; 10], 1),
            Err(RecognizerError::InferenceInput(_))
        ));
    }

    #[test]
    fn test_predict_batch_matches_single_predictions() {
        let engine = engine();
        let images = vec![
            DynamicImage::ImageLuma8(GrayImage::from_pixel(30, 30, Luma([0u8]))),
            DynamicImage::ImageLuma8(GrayImage::from_pixel(400, 200, Luma([255u8]))),
        ];

        let batch = engine.predict_batch(&images).unwrap();
        assert_eq!(batch.len(), 2);
        for (image, prediction) in images.iter().zip(&batch) {
            assert_eq!(&engine.predict_detailed(image).unwrap(), prediction);
        }

        let with_empty = vec![images[0].clone(), DynamicImage::ImageLuma8(GrayImage::new(0, 5))];
        assert!(engine.predict_batch(&with_empty).is_err());
    }

    #[test]
    fn test_mismatched_parts_are_rejected() {
        let device = Default::default();
        let model = SymbolClassifierConfig::new(2).init::<TestBackend>(&device);
        assert!(matches!(
            InferenceEngine::from_parts(model, LabelMap::from_labels(["a", "b", "c"]), &device),
            Err(RecognizerError::ArtifactMismatch { .. })
        ));
    }

    #[test]
    fn test_cloned_engines_predict_concurrently() {
        let engine = engine();
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(100, 50, Luma([200u8])));
        let expected = engine.predict(&image).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                let image = image.clone();
                std::thread::spawn(move || engine.predict(&image).unwrap())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }
}
