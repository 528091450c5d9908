//! サーバーの共有状態

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::service::RiceService;

/// リクエスト間で共有する状態（起動後は変更しない）
pub struct AppState {
    pub service: Arc<RiceService>,
    /// フロントエンドのビルド出力
    pub static_dir: PathBuf,
    started_at: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(service: Arc<RiceService>, static_dir: PathBuf) -> Self {
        Self {
            service,
            static_dir,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
