//! 撮影 → 分類サイクル
//!
//! 1件ずつしか処理しないワーカーです。処理中に次の撮影が来た場合は `Busy` を返し、
//! 呼び出し側が後で再送します。分類はブロッキングスレッドで行うので、
//! プレビューや監視ループは止まりません。

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ClassifyError;
use crate::model::CaptureSettings;
use crate::prediction::Outcome;
use crate::preprocess::is_image_file;
use crate::service::RiceService;

/// 1回の撮影の分類結果
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub outcome: Outcome,
    /// 保存した撮影画像（`keep_captures` が有効な場合のみ）
    pub saved_to: Option<PathBuf>,
}

/// 投入結果
pub enum Submission {
    Started(JoinHandle<Result<CaptureReport, ClassifyError>>),
    /// 前の撮影を処理中
    Busy,
}

/// 処理中フラグを解放するガード（成功・失敗・パニックのいずれでも解放）
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 同時に1件だけ分類するワーカー
#[derive(Clone)]
pub struct CaptureWorker {
    service: Arc<RiceService>,
    settings: CaptureSettings,
    in_flight: Arc<AtomicBool>,
}

impl CaptureWorker {
    pub fn new(service: Arc<RiceService>, settings: CaptureSettings) -> Self {
        Self {
            service,
            settings,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// 撮影画像を投入（tokio ランタイム内で呼ぶこと）
    ///
    /// `extension` は保存時の拡張子（"jpg" など）。
    pub fn try_submit(&self, frame: Vec<u8>, extension: &str) -> Submission {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Submission::Busy;
        }

        let guard = InFlightGuard(self.in_flight.clone());
        let service = self.service.clone();
        let settings = self.settings.clone();
        let extension = extension.to_string();

        Submission::Started(tokio::task::spawn_blocking(move || {
            let _guard = guard;
            run_capture(&service, &settings, &frame, &extension)
        }))
    }
}

fn run_capture(
    service: &RiceService,
    settings: &CaptureSettings,
    frame: &[u8],
    extension: &str,
) -> Result<CaptureReport, ClassifyError> {
    if settings.keep_captures {
        std::fs::create_dir_all(&settings.assets_dir)?;
        let file_name = format!(
            "img_{}.{}",
            chrono::Local::now().timestamp_millis(),
            extension
        );
        let path = settings.assets_dir.join(file_name);
        std::fs::write(&path, frame)?;
        info!("撮影画像を保存しました: {}", path.display());

        let outcome = service.classify_path(&path)?;
        return Ok(CaptureReport {
            outcome,
            saved_to: Some(path),
        });
    }

    let work_dir = settings
        .work_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    std::fs::create_dir_all(&work_dir)?;

    // drop 時に削除されるので、分類が失敗してもファイルは残らない
    let mut temp = tempfile::Builder::new()
        .prefix("capture_")
        .suffix(&format!(".{}", extension))
        .tempfile_in(&work_dir)?;
    temp.write_all(frame)?;
    temp.flush()?;
    debug!("一時ファイル: {}", temp.path().display());

    let outcome = service.classify_path(temp.path())?;
    Ok(CaptureReport {
        outcome,
        saved_to: None,
    })
}

/// ファイルの大きさと更新時刻（書き込み途中の判定に使う）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

type PendingCapture = (PathBuf, JoinHandle<Result<CaptureReport, ClassifyError>>);

/// 画像が置かれるディレクトリを監視して順に分類する
///
/// 投入済みの画像は投入時の大きさと更新時刻で覚えておき、どちらかが変われば
/// 再投入します（書き込み途中で分類に失敗した画像も、書き終われば分類されます）。
pub struct DropFolderWatcher {
    dir: PathBuf,
    seen: HashMap<PathBuf, FileStamp>,
}

impl DropFolderWatcher {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            seen: HashMap::new(),
        }
    }

    /// 未処理の画像を1件投入する
    ///
    /// ワーカーが処理中なら何もせず、その画像は次回以降に回します。
    pub fn poll(&mut self, worker: &CaptureWorker) -> std::io::Result<Option<PendingCapture>> {
        if worker.is_busy() {
            return Ok(None);
        }

        let mut pending = Vec::new();
        let mut present = HashSet::new();
        for path in std::fs::read_dir(&self.dir)?.filter_map(|entry| entry.ok().map(|e| e.path())) {
            if !is_image_file(&path) {
                continue;
            }
            // 列挙後に消えたファイルは飛ばす
            let Ok(stamp) = FileStamp::of(&path) else {
                continue;
            };
            if self.seen.get(&path) != Some(&stamp) {
                pending.push((path.clone(), stamp));
            }
            present.insert(path);
        }
        // 消えたファイルは忘れる
        self.seen.retain(|path, _| present.contains(path));
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        let Some((path, stamp)) = pending.into_iter().next() else {
            return Ok(None);
        };

        let frame = match std::fs::read(&path) {
            Ok(frame) => frame,
            Err(e) => {
                // 読めないファイルで後続を止めないよう、変化するまで飛ばす
                self.seen.insert(path, stamp);
                return Err(e);
            }
        };
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "png".to_string());

        match worker.try_submit(frame, &extension) {
            Submission::Started(handle) => {
                self.seen.insert(path.clone(), stamp);
                Ok(Some((path, handle)))
            }
            Submission::Busy => Ok(None),
        }
    }

    /// 1周期分の処理（エラーはログに残して監視を続ける）
    fn tick(&mut self, worker: &CaptureWorker) -> Option<PendingCapture> {
        match self.poll(worker) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("監視ディレクトリを読めません {}: {}", self.dir.display(), e);
                None
            }
        }
    }

    /// Ctrl+C まで監視を続ける
    pub async fn run(mut self, worker: CaptureWorker, fps: u32) -> anyhow::Result<()> {
        let interval_ms = 1000 / u64::from(fps.max(1));
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        info!("監視を開始します: {} ({} 回/秒)", self.dir.display(), fps);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("監視を終了します");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Some((path, handle)) = self.tick(&worker) {
                        tokio::spawn(async move {
                            match handle.await {
                                Ok(Ok(report)) => print_report(&path, &report.outcome),
                                Ok(Err(e)) => error!("分類に失敗しました {}: {}", path.display(), e),
                                Err(e) => error!("分類スレッドエラー {}: {}", path.display(), e),
                            }
                        });
                    }
                }
            }
        }
    }
}

/// 分類結果を1行で表示
pub fn print_report(path: &Path, outcome: &Outcome) {
    match outcome {
        Outcome::Classified {
            label, confidence, ..
        } => println!(
            "{}: {} rice identified ({:.1}%)",
            path.display(),
            label,
            confidence * 100.0
        ),
        Outcome::Unclassified { confidence } => println!(
            "{}: rice can't be identified (max {:.1}%)",
            path.display(),
            confidence * 100.0
        ),
        Outcome::NoReferenceMatch { best_score } => println!(
            "{}: no matching reference image (best SSIM {:.3})",
            path.display(),
            best_score
        ),
    }
}
