use std::{
    io::{self, IoSlice, Read, Write},
    net,
    os::fd::{AsRawFd, RawFd},
    path::PathBuf,
};

use mio::{Interest, Registry, Token, event::Source};
use socket2::{Domain, Protocol, Socket, Type};

use crate::endpoint::Endpoint;

/// Non-blocking kernel stream socket, TCP or local-domain.
pub enum StreamHandle {
    Tcp(mio::net::TcpStream),
    Local(mio::net::UnixStream),
}

impl StreamHandle {
    /// Open a fresh non-blocking socket, bind the source endpoint if one is
    /// configured and start the kernel connect. A would-block from the
    /// connect is expected; completion is observed via writability.
    pub fn start_connect(
        remote: &Endpoint,
        source: Option<&Endpoint>,
        reuse_address: bool,
    ) -> io::Result<Self> {
        match remote {
            Endpoint::Ip(addr) => {
                let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
                let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
                socket.set_nonblocking(true)?;
                if reuse_address {
                    socket.set_reuse_address(true)?;
                }
                if let Some(Endpoint::Ip(src)) = source {
                    socket.bind(&(*src).into())?;
                }
                in_progress_ok(socket.connect(&(*addr).into()))?;
                Ok(Self::Tcp(mio::net::TcpStream::from_std(socket.into())))
            }
            Endpoint::Local(path) => {
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.set_nonblocking(true)?;
                if let Some(Endpoint::Local(src)) = source {
                    socket.bind(&socket2::SockAddr::unix(src)?)?;
                }
                in_progress_ok(socket.connect(&socket2::SockAddr::unix(path)?))?;
                Ok(Self::Local(mio::net::UnixStream::from_std(
                    std::os::unix::net::UnixStream::from(std::os::fd::OwnedFd::from(socket)),
                )))
            }
        }
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Self::Tcp(s) => s.local_addr().map(Endpoint::Ip),
            Self::Local(s) => s.local_addr().map(|a| Endpoint::Local(unix_path(&a))),
        }
    }

    pub fn peer_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Self::Tcp(s) => s.peer_addr().map(Endpoint::Ip),
            Self::Local(s) => s.peer_addr().map(|a| Endpoint::Local(unix_path(&a))),
        }
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Self::Tcp(s) => s.take_error(),
            Self::Local(s) => s.take_error(),
        }
    }

    pub fn shutdown(&self, how: net::Shutdown) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(how),
            Self::Local(s) => s.shutdown(how),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Local(s) => s.read(buf),
        }
    }

    pub fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write_vectored(bufs),
            Self::Local(s) => s.write_vectored(bufs),
        }
    }
}

impl From<mio::net::TcpStream> for StreamHandle {
    fn from(stream: mio::net::TcpStream) -> Self {
        Self::Tcp(stream)
    }
}

impl From<mio::net::UnixStream> for StreamHandle {
    fn from(stream: mio::net::UnixStream) -> Self {
        Self::Local(stream)
    }
}

impl AsRawFd for StreamHandle {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Local(s) => s.as_raw_fd(),
        }
    }
}

impl Source for StreamHandle {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.register(registry, token, interests),
            Self::Local(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.reregister(registry, token, interests),
            Self::Local(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.deregister(registry),
            Self::Local(s) => s.deregister(registry),
        }
    }
}

fn unix_path(addr: &std::os::unix::net::SocketAddr) -> PathBuf {
    addr.as_pathname().map_or_else(PathBuf::new, PathBuf::from)
}

fn in_progress_ok(result: io::Result<()>) -> io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}
