//! Unix domain socket transport between the CLI and the daemon.

use anyhow::{anyhow, Result};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};

pub use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

pub struct IpcListener {
    listener: UnixListener,
    path: String,
}

impl IpcListener {
    /// Bind `path`, replacing a socket file nobody is listening on.
    pub async fn bind(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            match UnixStream::connect(path).await {
                Ok(_) => {
                    return Err(anyhow!(
                        "Socket {} is already in use by another daemon",
                        path
                    ));
                }
                Err(_) => {
                    tracing::info!("Removing stale socket file: {}", path);
                    crate::socket_path::remove_socket_file(path)?;
                }
            }
        }

        if let Some(parent) = crate::socket_path::get_socket_parent_dir(path) {
            std::fs::create_dir_all(parent)?;
        }

        let listener = match UnixListener::bind(path) {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!("Socket {} in use, retrying bind once", path);
                tokio::time::sleep(Duration::from_millis(100)).await;
                UnixListener::bind(path)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(anyhow!(
                    "Permission denied binding UNIX socket at {}. Set SOURCELENS_SOCKET_PATH to a writable location.",
                    path
                ));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            listener,
            path: path.to_string(),
        })
    }

    pub async fn accept(&self) -> Result<IpcStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcStream { stream })
    }

    pub fn local_addr(&self) -> &str {
        &self.path
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        if let Err(e) = crate::socket_path::remove_socket_file(&self.path) {
            tracing::trace!("Failed to remove socket file {}: {}", self.path, e);
        }
    }
}

pub struct IpcStream {
    stream: UnixStream,
}

impl IpcStream {
    pub async fn connect(path: &str) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self { stream })
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

impl AsyncRead for IpcStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

pub async fn bind(path: &str) -> Result<IpcListener> {
    IpcListener::bind(path).await
}

pub async fn connect(path: &str) -> Result<IpcStream> {
    IpcStream::connect(path).await
}
