//! Tracing setup for the daemon and CLI, plus the crash log panic hook.

pub mod log_buffer;

pub use log_buffer::{LogBuffer, MemoryLogLayer};

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` when set, otherwise `default_level`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Daemon subscriber: stderr output plus the in-memory buffer behind `logs`.
pub fn init_daemon_logging(default_level: &str, buffer: LogBuffer) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .with(MemoryLogLayer::new(buffer))
        .try_init()?;
    Ok(())
}

/// CLI subscriber: stderr only, so stdout stays clean JSON.
pub fn init_cli_logging(default_level: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()?;
    Ok(())
}

pub fn crash_log_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sourcelens")
        .join("daemon-crashes.log")
}

/// Append panics with a backtrace to [`crash_log_path`] and echo them to stderr.
pub fn install_crash_hook() -> PathBuf {
    let path = crash_log_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let hook_path = path.clone();
    std::panic::set_hook(Box::new(move |panic_info| {
        let report = format!(
            "\n=== SOURCELENS DAEMON CRASH ===\nTimestamp: {}\nPid: {}\nPanic: {}\nBacktrace:\n{}\n===============================\n\n",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f UTC"),
            std::process::id(),
            panic_info,
            std::backtrace::Backtrace::force_capture()
        );
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&hook_path)
        {
            let _ = file.write_all(report.as_bytes());
            let _ = file.flush();
        }
        eprintln!("{report}");
    }));

    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_log_location() {
        let path = crash_log_path();
        assert!(path.ends_with("sourcelens/daemon-crashes.log"));
    }
}
