//! 機械学習モデルの共通定義
//!
//! 手書き記号分類用のCNNモデルと、学習・推論で共通の画像前処理を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use image::{imageops::FilterType, DynamicImage};

use crate::error::{RecognizerError, Result as RecResult};

/// 入力画像サイズ（正方形、グレースケール1チャネル）
pub const IMAGE_SIZE: usize = 28;

/// 1サンプルあたりの画素数
pub const IMAGE_PIXELS: usize = IMAGE_SIZE * IMAGE_SIZE;

/// モデル設定
#[derive(Config, Debug)]
pub struct SymbolClassifierConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 全結合隠れ層のユニット数
    #[config(default = 128)]
    pub hidden_size: usize,
    #[config(default = 0.2)]
    pub dropout_block1: f64,
    #[config(default = 0.3)]
    pub dropout_block2: f64,
    #[config(default = 0.5)]
    pub dropout_dense: f64,
}

impl SymbolClassifierConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> SymbolClassifier<B> {
        // サイズ計算（3x3 valid畳み込み → 2x2プーリング）:
        // 28 -> 26 -> 13 -> 11 -> 5 -> 3 -> 1
        let feature_map_size = (0..3).fold(IMAGE_SIZE, |size, _| (size - 2) / 2);
        let flattened = 128 * feature_map_size * feature_map_size;

        tracing::debug!(
            num_classes = self.num_classes,
            flattened,
            hidden = self.hidden_size,
            "initializing symbol classifier"
        );

        SymbolClassifier {
            conv1: Conv2dConfig::new([1, 32], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).init(),
            norm1: BatchNormConfig::new(32).with_epsilon(1e-3).init(device),
            dropout1: DropoutConfig::new(self.dropout_block1).init(),

            conv2: Conv2dConfig::new([32, 64], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).init(),
            norm2: BatchNormConfig::new(64).with_epsilon(1e-3).init(device),
            dropout2: DropoutConfig::new(self.dropout_block2).init(),

            conv3: Conv2dConfig::new([64, 128], [3, 3]).init(device),
            pool3: MaxPool2dConfig::new([2, 2]).init(),
            norm3: BatchNormConfig::new(128).with_epsilon(1e-3).init(device),

            fc1: LinearConfig::new(flattened, self.hidden_size).init(device),
            dropout_fc: DropoutConfig::new(self.dropout_dense).init(),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),

            activation: Relu::new(),
        }
    }
}

/// 手書き記号分類用CNNモデル
///
/// # アーキテクチャ
/// - Conv 3x3 (32) + ReLU → MaxPool 2x2 → BatchNorm → Dropout(0.2)
/// - Conv 3x3 (64) + ReLU → MaxPool 2x2 → BatchNorm → Dropout(0.3)
/// - Conv 3x3 (128) + ReLU → MaxPool 2x2 → BatchNorm
/// - Flatten → FC 128 + ReLU → Dropout(0.5) → FC num_classes
/// - Softmax（`probabilities`）
///
/// Dropout と BatchNorm の学習/推論モードはバックエンドで切り替わります。
/// Autodiff バックエンド上では学習モード、`valid()` 後は推論モード
/// （Dropoutは恒等写像、BatchNormは移動統計量を使用）になります。
#[derive(Module, Debug)]
pub struct SymbolClassifier<B: Backend> {
    conv1: Conv2d<B>, // 1 -> 32
    pool1: MaxPool2d,
    norm1: BatchNorm<B>,
    dropout1: Dropout,

    conv2: Conv2d<B>, // 32 -> 64
    pool2: MaxPool2d,
    norm2: BatchNorm<B>,
    dropout2: Dropout,

    conv3: Conv2d<B>, // 64 -> 128
    pool3: MaxPool2d,
    norm3: BatchNorm<B>,

    fc1: Linear<B>, // 128 -> hidden
    dropout_fc: Dropout,
    fc2: Linear<B>, // hidden -> num_classes

    activation: Relu,
}

impl<B: Backend> SymbolClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 1, 28, 28]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);
        let x = self.norm1.forward(x);
        let x = self.dropout1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);
        let x = self.norm2.forward(x);
        let x = self.dropout2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool3.forward(x);
        let x = self.norm3.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout_fc.forward(x);

        self.fc2.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]（各行の合計は1）
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習・検証用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    /// 最終全結合層の出力幅（クラス数）
    pub fn num_classes(&self) -> usize {
        self.fc2.weight.dims()[1]
    }
}

/// 最大値のインデックス（同値の場合は最小インデックス）
pub fn argmax_first(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, current)) if v <= current => {}
            _ if v.is_nan() => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// テンソルをホスト側の f32 列に変換
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> RecResult<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| RecognizerError::TensorData(format!("{e:?}")))
}

/// 画像を正規化
///
/// グレースケール化 → 28x28へリサイズ（Catmull-Rom、アスペクト比は保持しない）→ 255で除算。
///
/// # 戻り値
/// - [0, 1] の画素値を行優先で平坦化したもの（長さ 784）
pub fn normalize_image(img: &DynamicImage) -> RecResult<Vec<f32>> {
    if img.width() == 0 || img.height() == 0 {
        return Err(RecognizerError::InferenceInput(format!(
            "bitmap has zero size ({}x{})",
            img.width(),
            img.height()
        )));
    }

    let gray = img.to_luma8();
    let resized = image::imageops::resize(
        &gray,
        IMAGE_SIZE as u32,
        IMAGE_SIZE as u32,
        FilterType::CatmullRom,
    );

    Ok(resized
        .into_raw()
        .into_iter()
        .map(|v| v as f32 / 255.0)
        .collect())
}

/// 画像ファイルを読み込んで正規化
///
/// 読み込み・前処理の失敗はいずれもサンプル単位の `SampleDecode` として返します。
pub fn load_and_normalize_image(path: &std::path::Path) -> RecResult<Vec<f32>> {
    let decode_error = |source| RecognizerError::SampleDecode {
        path: path.to_path_buf(),
        source,
    };

    let img = image::open(path).map_err(decode_error)?;
    normalize_image(&img).map_err(|_| {
        decode_error(image::ImageError::Parameter(
            image::error::ParameterError::from_kind(
                image::error::ParameterErrorKind::DimensionMismatch,
            ),
        ))
    })
}
