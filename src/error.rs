//! ライブラリ共通のエラー型
//!
//! 学習前に中断すべき設定エラー、サンプル単位で回復可能なデコードエラー、
//! 読み込み時に致命的となるアーティファクト不整合、推論入力エラーを区別します。

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecognizerError>;

#[derive(Error, Debug)]
pub enum RecognizerError {
    /// サンプルディレクトリが空・存在しない、クラス数が2未満など
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `<label>_<index>.<ext>` の命名規則に従わないファイル
    #[error(
        "files do not follow the <label>_<index>.<ext> naming convention: {}",
        files.join(", ")
    )]
    NamingConvention { files: Vec<String> },

    /// 破損した画像ファイル（既定ではスキップされる）
    #[error("failed to decode sample {}: {source}", path.display())]
    SampleDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// モデルとラベルマップのクラス数が一致しない
    #[error(
        "artifact mismatch: model has {model_classes} output classes \
         but label map has {label_classes} entries"
    )]
    ArtifactMismatch {
        model_classes: usize,
        label_classes: usize,
    },

    #[error("invalid artifact: {0}")]
    Artifact(String),

    /// 推論入力の前処理に失敗（エンジン自体は引き続き使用可能）
    #[error("invalid inference input: {0}")]
    InferenceInput(String),

    /// テンソルとホスト側データの変換失敗
    #[error("tensor data conversion failed: {0}")]
    TensorData(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RecognizerError {
    /// サンプル単位で回復可能なエラーかどうか
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RecognizerError::SampleDecode { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_decode_errors_are_recoverable() {
        let decode = RecognizerError::SampleDecode {
            path: PathBuf::from("plus_0.png"),
            source: image::ImageError::IoError(std::io::Error::other("truncated")),
        };
        assert!(decode.is_recoverable());
        assert!(!RecognizerError::Configuration("empty".into()).is_recoverable());
        assert!(!RecognizerError::ArtifactMismatch {
            model_classes: 3,
            label_classes: 2
        }
        .is_recoverable());
    }

    #[test]
    fn test_naming_convention_message_lists_files() {
        let err = RecognizerError::NamingConvention {
            files: vec!["plus.png".into(), "minus-1.png".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("plus.png"));
        assert!(msg.contains("minus-1.png"));
    }
}
