//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、学習・データ拡張のハイパーパラメータ、保存先などをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
    /// WGPU (GPU) バックエンド（`wgpu` フィーチャーが必要）
    Wgpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            other => Err(format!("unknown device type: {other}")),
        }
    }
}

/// 破損サンプルの扱い
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DecodePolicy {
    /// ログを出してスキップし、構築を続行する
    #[default]
    Skip,
    /// 最初の破損ファイルで構築全体を中断する
    Abort,
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数（早期終了は行わない）
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 初期学習率
    pub learning_rate: f64,
    /// ランダムシード（分割・シャッフル・データ拡張・重み初期化）
    pub seed: u64,
    /// トレーニングデータの割合
    pub train_ratio: f32,
    /// 学習率を下げる際の倍率
    pub lr_factor: f64,
    /// 改善なしエポックがこの回数続いたら学習率を下げる
    pub lr_patience: usize,
    /// 学習率の下限
    pub min_learning_rate: f64,
    /// 改善とみなす検証損失の最小減少量
    pub lr_min_delta: f64,
    pub decode_policy: DecodePolicy,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 50,
            batch_size: 32,
            learning_rate: 1e-3,
            seed: 42,
            train_ratio: 0.8,
            lr_factor: 0.5,
            lr_patience: 3,
            min_learning_rate: 1e-5,
            lr_min_delta: 1e-4,
            decode_policy: DecodePolicy::Skip,
        }
    }
}

/// データ拡張の範囲（いずれも ± の最大値）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentationSettings {
    /// 回転角（度）
    pub rotation_degrees: f32,
    /// 横方向の平行移動（画像幅に対する割合）
    pub width_shift: f32,
    /// 縦方向の平行移動（画像高さに対する割合）
    pub height_shift: f32,
    /// せん断係数
    pub shear: f32,
    /// 拡大縮小率
    pub zoom: f32,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rotation_degrees: 20.0,
            width_shift: 0.2,
            height_shift: 0.2,
            shear: 0.2,
            zoom: 0.2,
        }
    }
}

impl AugmentationSettings {
    /// 変換を一切行わない設定
    pub fn disabled() -> Self {
        Self {
            rotation_degrees: 0.0,
            width_shift: 0.0,
            height_shift: 0.0,
            shear: 0.0,
            zoom: 0.0,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データ拡張設定
    pub augmentation: AugmentationSettings,
    /// 学習済みモデル（tar.gz）の保存先
    pub model_path: String,
    /// サンプル画像ディレクトリ
    pub dataset_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            training: TrainingSettings::default(),
            augmentation: AugmentationSettings::default(),
            model_path: "models/symbol_classifier.tar.gz".to_string(),
            dataset_dir: "dataset_symbols".to_string(),
        }
    }
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない・読めない場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "設定ファイルを読み込みました");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "設定ファイルの読み込みに失敗しました。デフォルト設定を使用します"
                );
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
