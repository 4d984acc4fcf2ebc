//! モデルメタデータの定義
//!
//! モデルアーカイブ内の `metadata.json` として保存され、クラス数・入力サイズ・
//! 学習条件と最終的な検証結果を記録します。

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// アーカイブ形式のバージョン
pub const FORMAT_VERSION: u32 = 1;

/// モデルメタデータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    #[serde(default = "default_format_version")]
    pub format_version: u32,

    /// 出力クラス数（labels.json のエントリ数と一致する）
    pub num_classes: usize,

    /// モデル入力サイズ（正方形、通常28）
    pub image_size: usize,

    /// 実行したエポック数
    pub num_epochs: usize,

    /// 学習に使用したランダムシード
    pub seed: u64,

    /// 最終エポックの検証損失（検証データが空の場合はなし）
    #[serde(default)]
    pub final_valid_loss: Option<f64>,

    #[serde(default)]
    pub final_valid_accuracy: Option<f64>,

    /// モデルの学習時刻（RFC 3339形式）
    pub trained_at: String,
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        num_classes: usize,
        image_size: usize,
        num_epochs: usize,
        seed: u64,
        final_valid_loss: Option<f64>,
        final_valid_accuracy: Option<f64>,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            num_classes,
            image_size,
            num_epochs,
            seed,
            final_valid_loss,
            final_valid_accuracy,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
