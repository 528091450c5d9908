//! RiceScan コマンドライン
//!
//! 学習、HTTPサーバー、単発分類、ディレクトリ監視、データセット整備を1つのバイナリで提供します。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use ricescan_lib::capture::{print_report, CaptureWorker, DropFolderWatcher};
use ricescan_lib::commands::{load_service, train};
use ricescan_lib::dataset::{augment_directory, split_directory, ClassLabels, SplitRatios};
use ricescan_lib::logging::init_logging;
use ricescan_lib::model::{load_metadata, AppConfig, DeviceType};
use ricescan_lib::server::{self, AppState};

/// 米の品種分類ツール
#[derive(Parser, Debug)]
#[command(name = "ricescan")]
#[command(version)]
#[command(about = "Rice variety classifier: training pipeline and inference service")]
struct Cli {
    /// 設定ファイル（JSON）
    #[arg(short, long, global = true, env = "RICESCAN_CONFIG")]
    config: Option<PathBuf>,

    /// モデルファイル（tar.gz）
    #[arg(short, long, global = true, env = "RICESCAN_MODEL")]
    model: Option<PathBuf>,

    /// 計算デバイス（wgpu / cpu）
    #[arg(long, global = true, env = "RICESCAN_DEVICE")]
    device: Option<DeviceType>,

    /// デバッグログを出す
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// HTTPサーバーを起動
    Serve {
        #[arg(long, env = "RICESCAN_HOST")]
        host: Option<String>,

        #[arg(short, long, env = "RICESCAN_PORT")]
        port: Option<u16>,

        /// フロントエンドのビルド出力
        #[arg(long)]
        static_dir: Option<PathBuf>,

        /// 参照画像照合に使うデータセット（指定すると照合を有効化）
        #[arg(long)]
        reference_dir: Option<PathBuf>,

        /// 信頼度しきい値
        #[arg(long)]
        threshold: Option<f32>,
    },

    /// モデルを学習
    Train {
        /// データセットのルート（クラスごとのサブディレクトリ）
        #[arg(short, long)]
        dataset: Option<PathBuf>,

        #[arg(short, long)]
        epochs: Option<usize>,

        #[arg(short, long)]
        batch_size: Option<usize>,

        #[arg(long)]
        learning_rate: Option<f64>,

        /// 入力画像サイズ（正方形）
        #[arg(long)]
        input_size: Option<u32>,

        /// ランダム反転・回転を行う
        #[arg(long)]
        augment: bool,
    },

    /// 画像ファイルを分類
    Classify {
        #[arg(required = true)]
        images: Vec<PathBuf>,

        #[arg(long)]
        threshold: Option<f32>,
    },

    /// ディレクトリに置かれた画像を順に分類
    Watch {
        dir: PathBuf,

        /// 撮影画像を assets に保存する
        #[arg(long)]
        keep_captures: bool,

        /// 監視周期（回/秒）
        #[arg(long)]
        fps: Option<u32>,
    },

    /// データセットを train/val/test に分割してコピー
    Split {
        input: PathBuf,
        output: PathBuf,

        #[arg(long, default_value_t = 0.8)]
        train_ratio: f64,

        #[arg(long, default_value_t = 0.1)]
        val_ratio: f64,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// 90度ずつ回転した画像を書き出してデータを増やす
    Augment { input: PathBuf, output: PathBuf },

    /// クラス名を表示（モデルファイル、またはデータセットから）
    Classes {
        #[arg(short, long)]
        dataset: Option<PathBuf>,
    },

    /// 現在の設定を表示
    Config {
        /// コマンドラインの指定を反映した設定を設定ファイルに書き出す
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load_explicit_or_default(cli.config.as_deref())?;
    if let Some(model) = cli.model {
        config.model.model_path = model;
    }
    if let Some(device) = cli.device {
        config.device_type = device;
    }

    match cli.command {
        Command::Serve {
            host,
            port,
            static_dir,
            reference_dir,
            threshold,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(static_dir) = static_dir {
                config.server.static_dir = static_dir;
            }
            if let Some(reference_dir) = reference_dir {
                config.matcher.enabled = true;
                config.matcher.dataset_dir = reference_dir;
            }
            if let Some(threshold) = threshold {
                config.model.confidence_threshold = threshold;
            }

            info!("RiceScan v{}", env!("CARGO_PKG_VERSION"));
            let service = load_blocking(&config).await?;
            let state = Arc::new(AppState::new(service, config.server.static_dir.clone()));
            server::serve(state, &config.server).await
        }

        Command::Train {
            dataset,
            epochs,
            batch_size,
            learning_rate,
            input_size,
            augment,
        } => {
            if let Some(dataset) = dataset {
                config.training.dataset_dir = dataset;
            }
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(learning_rate) = learning_rate {
                config.training.learning_rate = learning_rate;
            }
            if let Some(input_size) = input_size {
                config.model.input_size = input_size;
            }
            config.training.augment |= augment;

            let output = config.model.model_path.clone();
            tokio::task::spawn_blocking(move || train(&config, &output))
                .await
                .context("学習スレッドエラー")?
        }

        Command::Classify { images, threshold } => {
            if let Some(threshold) = threshold {
                config.model.confidence_threshold = threshold;
            }
            let service = load_blocking(&config).await?;

            tokio::task::spawn_blocking(move || {
                let mut failures = 0;
                for path in &images {
                    match service.classify_path(path) {
                        Ok(outcome) => print_report(path, &outcome),
                        Err(e) => {
                            failures += 1;
                            error!("{}: 分類できません: {}", path.display(), e);
                        }
                    }
                }
                if failures > 0 {
                    anyhow::bail!("{} 件の画像を分類できませんでした", failures);
                }
                Ok(())
            })
            .await
            .context("分類スレッドエラー")?
        }

        Command::Watch {
            dir,
            keep_captures,
            fps,
        } => {
            config.capture.keep_captures |= keep_captures;
            if let Some(fps) = fps {
                config.capture.poll_fps = fps;
            }
            if !dir.is_dir() {
                anyhow::bail!("監視対象のディレクトリがありません: {}", dir.display());
            }

            let service = load_blocking(&config).await?;
            let worker = CaptureWorker::new(service, config.capture.clone());
            DropFolderWatcher::new(&dir)
                .run(worker, config.capture.poll_fps)
                .await
        }

        Command::Split {
            input,
            output,
            train_ratio,
            val_ratio,
            seed,
        } => {
            let ratios = SplitRatios {
                train: train_ratio,
                val: val_ratio,
                test: 1.0 - train_ratio - val_ratio,
            };
            let report = split_directory(&input, &output, ratios, seed)?;
            println!(
                "train {} 枚, val {} 枚, test {} 枚: {}",
                report.train,
                report.val,
                report.test,
                output.display()
            );
            Ok(())
        }

        Command::Augment { input, output } => {
            let report = augment_directory(&input, &output)?;
            println!(
                "{} 枚を処理しました（スキップ {} 枚）: {}",
                report.processed,
                report.skipped.len(),
                output.display()
            );
            for path in &report.skipped {
                println!("  スキップ: {}", path);
            }
            Ok(())
        }

        Command::Classes { dataset } => {
            let names = match dataset {
                Some(dataset) => ClassLabels::discover(&dataset)?.into_vec(),
                None => class_names_from_model(&config.model.model_path)?,
            };
            println!("{}", serde_json::to_string_pretty(&names)?);
            Ok(())
        }

        Command::Config { write } => {
            config.display();
            if write {
                let path = cli.config.unwrap_or_else(AppConfig::default_path);
                config
                    .save(&path)
                    .with_context(|| format!("設定ファイルを書き出せません: {}", path.display()))?;
                println!("設定を保存しました: {}", path.display());
            }
            Ok(())
        }
    }
}

/// モデルの読み込みはブロッキング処理なので専用スレッドで行う
async fn load_blocking(config: &AppConfig) -> Result<Arc<ricescan_lib::RiceService>> {
    let config = config.clone();
    tokio::task::spawn_blocking(move || load_service(&config))
        .await
        .context("モデル読み込みスレッドエラー")?
}

fn class_names_from_model(model_path: &Path) -> Result<Vec<String>> {
    let metadata = load_metadata(model_path)
        .with_context(|| format!("モデルファイルを読み込めません: {}", model_path.display()))?;
    Ok(metadata.class_names)
}
