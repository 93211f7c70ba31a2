use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Installs the global subscriber: env-filtered stdout plus an optional
/// daily-rolling file appender. `log` macros are bridged through
/// `tracing-log`, so library code keeps using `log::{info, warn, ...}`.
///
/// Safe to call once per process; later calls are no-ops.
pub fn init_logger(level: &str, dir: Option<&str>) {
    if LogTracer::init().is_err() {
        // Already initialized (tests spin this up repeatedly).
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    match dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "tandem.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);

            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking);

            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .try_init();
        }
    }
}
