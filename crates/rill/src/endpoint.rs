use std::{fmt, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Transport endpoint: an IP address and port, or a local-domain path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Ip(SocketAddr),
    Local(PathBuf),
}

impl Endpoint {
    /// Endpoints that can never complete a connect: the unspecified address
    /// or port zero (or an empty local path). Rejected up front instead of
    /// burning a kernel attempt.
    pub fn is_trivially_invalid(&self) -> bool {
        match self {
            Self::Ip(addr) => addr.ip().is_unspecified() || addr.port() == 0,
            Self::Local(path) => path.as_os_str().is_empty(),
        }
    }

    pub fn ip(&self) -> Option<SocketAddr> {
        match self {
            Self::Ip(addr) => Some(*addr),
            Self::Local(_) => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl From<PathBuf> for Endpoint {
    fn from(path: PathBuf) -> Self {
        Self::Local(path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => addr.fmt(f),
            Self::Local(path) => path.display().fmt(f),
        }
    }
}
