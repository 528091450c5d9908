//! ログ初期化
//!
//! `RUST_LOG` が設定されていればそれを優先し、なければ `verbose` に応じて
//! info / debug を使います。

use tracing_subscriber::EnvFilter;

/// tracing サブスクライバを初期化（複数回呼んでも2回目以降は無視）
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info,wgpu=warn", default_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init();
}
