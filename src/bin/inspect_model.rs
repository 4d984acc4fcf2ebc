//! モデルアーカイブのメタデータとラベルマップを表示するツール

use std::path::PathBuf;

use anyhow::{Context, Result};
use symbol_recognizer_lib::model::{inspect_archive, print_metadata_info, AppConfig, Inspection};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("symbol_recognizer_lib=warn")
            }),
        )
        .init();

    // コマンドライン引数を取得
    let args: Vec<String> = std::env::args().collect();
    let model_path = if args.len() > 1 {
        PathBuf::from(&args[1])
    } else {
        PathBuf::from(AppConfig::load_or_default(AppConfig::default_path()).model_path)
    };

    println!("=== Model Inspector: {} ===", model_path.display());

    let inspection = inspect_archive(&model_path)
        .with_context(|| format!("failed to read {}", model_path.display()))?;

    match inspection {
        Inspection::Complete(contents) => {
            print_metadata_info(&contents.metadata, Some(&contents.labels));
            println!("重みサイズ: {} バイト", contents.model_binary.len());
        }
        Inspection::Partial { metadata, error } => {
            // メタデータだけでも表示してから失敗を報告する
            print_metadata_info(&metadata, None);
            return Err(error).context("archive is incomplete or inconsistent");
        }
    }
    Ok(())
}
