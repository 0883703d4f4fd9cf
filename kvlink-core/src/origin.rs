//! Origin tags and error kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sub-resource that produced a signal or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginTag {
    /// The storage engine, or the RPC stub standing in for it.
    Database,
    /// One client-side or per-connection TCP socket.
    TcpClient,
    /// The server's TCP listener.
    TcpServer,
    /// The framed RPC stream bound to a socket.
    RpcStream,
    /// The session itself (lifecycle and backoff signals).
    LevelServer,
}

impl OriginTag {
    pub const ALL: [OriginTag; 5] = [
        OriginTag::Database,
        OriginTag::TcpClient,
        OriginTag::TcpServer,
        OriginTag::RpcStream,
        OriginTag::LevelServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OriginTag::Database => "database",
            OriginTag::TcpClient => "tcp_client",
            OriginTag::TcpServer => "tcp_server",
            OriginTag::RpcStream => "rpc_stream",
            OriginTag::LevelServer => "level_server",
        }
    }
}

impl fmt::Display for OriginTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a routed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Protocol,
    Store,
    Config,
    Access,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Store => "store",
            ErrorKind::Config => "config",
            ErrorKind::Access => "access",
        };
        f.write_str(s)
    }
}
