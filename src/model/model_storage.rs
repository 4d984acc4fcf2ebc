//! モデルとラベルマップの永続化
//!
//! Tar.gz形式でモデル・ラベルマップ・メタデータを1ファイルに統合して保存・読み込みします。
//! 書き込みは一時ファイルへ行ってからリネームするため、読み込み側からは
//! 以前の完全なアーカイブか新しい完全なアーカイブのどちらかしか見えません。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス数、学習条件など）
//! - labels.json     - クラスインデックス → 正規ラベル
//! - model.bin       - モデルの重み（バイナリ）

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::error::{RecognizerError, Result};
use crate::labels::LabelMap;
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const LABELS_ENTRY: &str = "labels.json";
const MODEL_ENTRY: &str = "model.bin";

/// アーカイブの中身
#[derive(Debug)]
pub struct ArchiveContents {
    pub metadata: ModelMetadata,
    pub labels: LabelMap,
    pub model_binary: Vec<u8>,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "model".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)?;
    Ok(())
}

/// メタデータ・ラベルマップ・モデルバイナリをTar.gz形式で保存
///
/// クラス数が揃っていない組み合わせは保存しない
pub fn write_archive(
    output_path: &Path,
    metadata: &ModelMetadata,
    labels: &LabelMap,
    model_binary: &[u8],
) -> Result<()> {
    if metadata.num_classes != labels.len() {
        return Err(RecognizerError::ArtifactMismatch {
            model_classes: metadata.num_classes,
            label_classes: labels.len(),
        });
    }

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(output_path);
    let written = (|| -> Result<()> {
        let file = File::create(&tmp)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = Builder::new(encoder);

        append_entry(&mut builder, METADATA_ENTRY, metadata.to_json_string()?.as_bytes())?;
        append_entry(&mut builder, LABELS_ENTRY, labels.to_json_string()?.as_bytes())?;
        append_entry(&mut builder, MODEL_ENTRY, model_binary)?;

        let file = builder.into_inner()?.finish()?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = written {
        std::fs::remove_file(&tmp).ok();
        return Err(e);
    }

    std::fs::rename(&tmp, output_path)?;
    tracing::info!(path = %output_path.display(), classes = labels.len(), "model archive written");
    Ok(())
}

fn open_archive(path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let file = File::open(path).map_err(|e| {
        RecognizerError::Artifact(format!("failed to open {}: {e}", path.display()))
    })?;
    Ok(Archive::new(GzDecoder::new(file)))
}

/// Tar.gzからモデルメタデータのみを読み込む
pub fn load_metadata(path: &Path) -> Result<ModelMetadata> {
    let mut archive = open_archive(path)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(METADATA_ENTRY) {
            let mut json = String::new();
            entry.read_to_string(&mut json)?;
            return ModelMetadata::from_json_string(&json);
        }
    }

    Err(RecognizerError::Artifact(format!(
        "{METADATA_ENTRY} not found in {}",
        path.display()
    )))
}

/// 全エントリを読み込み、メタデータとラベルマップのクラス数を検証する
pub fn read_archive(path: &Path) -> Result<ArchiveContents> {
    let mut archive = open_archive(path)?;

    let mut metadata = None;
    let mut labels = None;
    let mut model_binary = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json = String::new();
                entry.read_to_string(&mut json)?;
                metadata = Some(ModelMetadata::from_json_string(&json)?);
            }
            LABELS_ENTRY => {
                let mut json = String::new();
                entry.read_to_string(&mut json)?;
                labels = Some(LabelMap::from_json_str(&json)?);
            }
            MODEL_ENTRY => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary = Some(buffer);
            }
            other => tracing::debug!(entry = other, "ignoring unknown archive entry"),
        }
    }

    let missing = |entry: &str| {
        RecognizerError::Artifact(format!("{entry} not found in {}", path.display()))
    };
    let metadata = metadata.ok_or_else(|| missing(METADATA_ENTRY))?;
    let labels = labels.ok_or_else(|| missing(LABELS_ENTRY))?;
    let model_binary = model_binary.ok_or_else(|| missing(MODEL_ENTRY))?;

    if metadata.num_classes != labels.len() {
        return Err(RecognizerError::ArtifactMismatch {
            model_classes: metadata.num_classes,
            label_classes: labels.len(),
        });
    }

    Ok(ArchiveContents {
        metadata,
        labels,
        model_binary,
    })
}

/// 表示用に読み込んだアーカイブ
#[derive(Debug)]
pub enum Inspection {
    Complete(ArchiveContents),
    /// 検証に失敗したがメタデータは読めたもの
    Partial {
        metadata: ModelMetadata,
        error: RecognizerError,
    },
}

/// アーカイブ全体を読み込み、失敗した場合のみメタデータ単独での読み込みを試みる
pub fn inspect_archive(path: &Path) -> Result<Inspection> {
    match read_archive(path) {
        Ok(contents) => Ok(Inspection::Complete(contents)),
        Err(error) => match load_metadata(path) {
            Ok(metadata) => Ok(Inspection::Partial { metadata, error }),
            Err(_) => Err(error),
        },
    }
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata, labels: Option<&LabelMap>) {
    println!("\n=== モデルメタデータ ===");
    println!("フォーマット: v{}", metadata.format_version);
    println!("クラス数: {}", metadata.num_classes);
    println!("モデル入力サイズ: {}x{}", metadata.image_size, metadata.image_size);
    println!("学習エポック数: {}", metadata.num_epochs);
    println!("シード: {}", metadata.seed);
    if let Some(loss) = metadata.final_valid_loss {
        println!("最終検証損失: {loss:.4}");
    }
    if let Some(accuracy) = metadata.final_valid_accuracy {
        println!("最終検証精度: {:.2}%", accuracy * 100.0);
    }
    println!("学習日時: {}", metadata.trained_at);
    if let Some(labels) = labels {
        println!("ラベル:");
        for (index, label) in labels.labels().iter().enumerate() {
            println!("  {index:>3}: {label}");
        }
    }
    println!("========================");
}

#[cfg(feature = "ml")]
mod weights {
    use std::path::Path;

    use burn::{
        module::Module,
        record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
        tensor::backend::Backend,
    };

    use super::{read_archive, write_archive};
    use crate::error::{RecognizerError, Result};
    use crate::labels::LabelMap;
    use crate::ml::ml_model::{SymbolClassifier, SymbolClassifierConfig};
    use crate::model::model_metadata::ModelMetadata;

    type WeightRecorder = BinBytesRecorder<FullPrecisionSettings>;

    /// 学習済みモデルとラベルマップを1つのアーカイブとして保存
    pub fn save_model<B: Backend>(
        path: &Path,
        model: &SymbolClassifier<B>,
        labels: &LabelMap,
        metadata: &ModelMetadata,
    ) -> Result<()> {
        if model.num_classes() != labels.len() {
            return Err(RecognizerError::ArtifactMismatch {
                model_classes: model.num_classes(),
                label_classes: labels.len(),
            });
        }

        // f32精度で保存
        let recorder = WeightRecorder::default();
        let bytes = Recorder::<B>::record(&recorder, model.clone().into_record(), ())
            .map_err(|e| RecognizerError::Artifact(format!("failed to serialize weights: {e}")))?;

        write_archive(path, metadata, labels, &bytes)
    }

    /// アーカイブからモデルとラベルマップを復元
    ///
    /// メタデータ・ラベルマップ・最終層の出力幅のいずれかが一致しなければエラー
    pub fn load_model<B: Backend>(
        path: &Path,
        device: &B::Device,
    ) -> Result<(SymbolClassifier<B>, LabelMap, ModelMetadata)> {
        let contents = read_archive(path)?;

        let recorder = WeightRecorder::default();
        let record = Recorder::<B>::load(&recorder, contents.model_binary, device)
            .map_err(|e| RecognizerError::Artifact(format!("failed to restore weights: {e}")))?;

        let model = SymbolClassifierConfig::new(contents.metadata.num_classes)
            .init::<B>(device)
            .load_record(record);

        if model.num_classes() != contents.labels.len() {
            return Err(RecognizerError::ArtifactMismatch {
                model_classes: model.num_classes(),
                label_classes: contents.labels.len(),
            });
        }

        tracing::info!(
            path = %path.display(),
            classes = contents.labels.len(),
            trained_at = %contents.metadata.trained_at,
            "model loaded"
        );
        Ok((model, contents.labels, contents.metadata))
    }
}

#[cfg(feature = "ml")]
pub use weights::{load_model, save_model};
