use crate::socket_path::pid_lock_path;
use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, info, warn};

/// Advisory lock next to the daemon socket holding the owner's PID.
///
/// The OS drops the `flock` when the owning process dies, so a file left
/// behind by a crashed daemon never blocks the next one.
pub struct PidLock {
    path: PathBuf,
    file: Option<File>,
}

impl PidLock {
    pub fn new(socket_path: &str) -> Self {
        Self {
            path: PathBuf::from(pid_lock_path(socket_path)),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn try_lock(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open PID lock {}", self.path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(match read_pid(&self.path) {
                Some(pid) => anyhow!("Another daemon instance is already running (PID: {})", pid),
                None => anyhow!("Another daemon instance holds {}", self.path.display()),
            });
        }

        if let Some(previous) = read_pid(&self.path) {
            if previous != process::id() {
                if is_process_running(previous) {
                    warn!(
                        "PID lock named live process {} but was unlocked, taking over",
                        previous
                    );
                } else {
                    debug!("Replacing stale PID {} in {}", previous, self.path.display());
                }
            }
        }

        file.set_len(0).context("Failed to truncate PID lock")?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", process::id()).context("Failed to write PID")?;
        file.flush().context("Failed to flush PID lock")?;

        info!(
            "Acquired PID lock at {} (PID: {})",
            self.path.display(),
            process::id()
        );
        self.file = Some(file);
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        if read_pid(&self.path) == Some(process::id()) {
            fs::remove_file(&self.path).context("Failed to remove PID lock")?;
        }
        let _ = FileExt::unlock(&file);
        debug!("Released PID lock at {}", self.path.display());
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!("Failed to release PID lock on drop: {}", e);
        }
    }
}

/// PID recorded in a lock file, if it holds one.
pub fn read_pid(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    // Signal 0 only checks that the process exists and we may signal it.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    false
}
