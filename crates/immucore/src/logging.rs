//! Tracing setup: stderr plus a log file under `/run/immucore`.

use std::path::Path;

use parking_lot::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Worker of the file writer. Taken and dropped by [`flush`].
static FILE_WORKER: Mutex<Option<WorkerGuard>> = parking_lot::const_mutex(None);

/// Flushes the log file when dropped.
#[must_use = "the log file is only flushed when the guard is dropped"]
#[derive(Debug)]
pub struct LogGuard(());

impl Drop for LogGuard {
    fn drop(&mut self) {
        flush();
    }
}

/// Write out buffered file output and stop the file writer.
///
/// Must run before the process image is replaced; later events only reach
/// stderr.
pub fn flush() {
    drop(FILE_WORKER.lock().take());
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins unless `debug` is set; the default level is `info`. When
/// `log_file` cannot be opened only stderr is used. The returned guard
/// flushes the file writer and must live as long as the process logs.
pub fn init(log_file: &Path, debug: bool) -> LogGuard {
    let filter = || {
        if debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        }
    };
    let stderr = fmt::layer().with_target(true).with_writer(std::io::stderr);

    let log_dir = log_file.parent().unwrap_or_else(|| Path::new("/"));
    let file_name = log_file
        .file_name()
        .map_or_else(|| "immucore.log".into(), |name| name.to_string_lossy());

    let appender = std::fs::create_dir_all(log_dir)
        .map_err(|e| e.to_string())
        .and_then(|()| {
            RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(file_name.into_owned())
                .build(log_dir)
                .map_err(|e| e.to_string())
        });

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init();
            *FILE_WORKER.lock() = Some(guard);
        }
        Err(e) => {
            let _ = tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .try_init();
            tracing::warn!(file = %log_file.display(), error = %e, "Log file unavailable, logging to stderr only");
        }
    }
    LogGuard(())
}
