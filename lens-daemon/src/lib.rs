// sourcelens daemon library
// Session pool around sourcekit-lsp plus the socket daemon that serves it

// Core modules
pub mod config;
pub mod error;
pub mod protocol;
pub mod socket_path;
pub mod symbols;
pub mod workspace;

// External process plumbing
pub mod lsp_server;
pub mod recovery;
pub mod session;
pub mod supervisor;

// Queries
pub mod engine;
pub mod pool;
pub mod search;
pub mod snippet;

// Daemon transport
pub mod daemon;
pub mod ipc;
pub mod logging;
pub mod pid_lock;

// Re-export commonly used types
pub use config::{DaemonConfig, LensConfig, PoolConfig, SessionConfig};
pub use daemon::{version_info, LensDaemon};
pub use engine::QueryEngine;
pub use error::{LensError, LensResult};
pub use ipc::{IpcListener, IpcStream};
pub use protocol::{
    DaemonMethod, DaemonRequest, DaemonResponse, ErrorBody, MessageCodec, PingResult,
    SearchSymbolsParams, StatusResult, SymbolInfoParams,
};
pub use search::{Preference, Scope};
pub use socket_path::{effective_socket_path, get_default_socket_path, remove_socket_file};
pub use symbols::{RankedSymbolSearchResult, SourceKind, SymbolInfo, SymbolSearchResult};
pub use workspace::{Workspace, WorkspaceKind};
