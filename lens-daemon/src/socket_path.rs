use std::path::{Path, PathBuf};

/// Default location of the daemon's Unix socket
pub fn get_default_socket_path() -> String {
    std::env::temp_dir()
        .join("sourcelens-daemon.sock")
        .to_string_lossy()
        .to_string()
}

/// Socket path honoring the `SOURCELENS_SOCKET_PATH` override
pub fn effective_socket_path() -> String {
    std::env::var("SOURCELENS_SOCKET_PATH").unwrap_or_else(|_| get_default_socket_path())
}

pub fn socket_exists(path: &str) -> bool {
    Path::new(path).exists()
}

/// Remove a leftover socket file; missing files are not an error.
pub fn remove_socket_file(path: &str) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn get_socket_parent_dir(path: &str) -> Option<PathBuf> {
    Path::new(path).parent().map(|p| p.to_path_buf())
}

/// PID lock file kept next to the socket, never the socket path itself
pub fn pid_lock_path(socket_path: &str) -> String {
    format!("{socket_path}.lock")
}
