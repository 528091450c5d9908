//! モデルファイルのメタデータを表示するツール

use std::path::PathBuf;

use ricescan_lib::model::{load_metadata, print_metadata_info, InferenceConfig};
use ricescan_lib::DEFAULT_CONFIDENCE_THRESHOLD;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let model_path = if args.len() > 1 {
        PathBuf::from(&args[1])
    } else {
        PathBuf::from("rice_classifier_model.tar.gz")
    };

    println!("=== RiceScan モデル情報 ===");
    println!("ファイル: {}", model_path.display());

    let result = load_metadata(&model_path).and_then(|metadata| {
        print_metadata_info(&metadata);
        InferenceConfig::load_from_model(&model_path, DEFAULT_CONFIDENCE_THRESHOLD)
    });

    match result {
        Ok(inference) => inference.print_info(),
        Err(e) => {
            eprintln!("✗ エラー: {:#}", e);
            std::process::exit(1);
        }
    }
}
