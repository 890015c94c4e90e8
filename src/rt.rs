//! The socket/event-loop collaborator. The pool core only needs two things
//! from it: a way to dial a resolved address, and a way to peek at an idle
//! socket without consuming its buffered bytes. Both are expressed as a
//! small trait plus a Tokio-backed default, the same split the teacher
//! uses for its own `rt::{TokioExecutor, TokioTimer}`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::origin::SockAddr;

/// A previously-connected byte stream, detached from whatever handled its
/// I/O and ready to be handed to a new owner. In this crate's Tokio-backed
/// model, "export"/"import" (the spec's names for this handoff) collapse
/// to simply moving the value: a `tokio::net::TcpStream` carries its own
/// fd and OS-level buffers wherever it goes, so there is no separate
/// detach/reattach step to perform.
#[derive(Debug)]
pub enum Conn {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Conn {
    /// Non-destructive 1-byte liveness probe (`MSG_PEEK`). `Ok(0)` means
    /// the peer closed; `Ok(n > 0)` means there is unexpectedly buffered
    /// data; `Err(WouldBlock)` means the socket is idle and healthy.
    pub(crate) fn peek_probe(&self) -> io::Result<usize> {
        let mut buf = [0u8; 1];
        match self {
            Conn::Tcp(s) => socket2::SockRef::from(s).peek(&mut buf),
            #[cfg(unix)]
            Conn::Unix(s) => socket2::SockRef::from(s).peek(&mut buf),
        }
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Establishes a fresh connection to a resolved peer address.
pub trait Connector: Send + Sync {
    fn connect(&self, addr: SockAddr) -> BoxFuture<'static, io::Result<Conn>>;
}

/// Default connector: plain TCP or Unix-domain dial via Tokio. No TLS --
/// the pool deals in already-connected byte streams, per the crate's
/// non-goals.
#[derive(Debug, Default)]
pub struct TokioConnector;

impl Connector for TokioConnector {
    fn connect(&self, addr: SockAddr) -> BoxFuture<'static, io::Result<Conn>> {
        Box::pin(async move {
            match addr {
                SockAddr::Tcp(sa) => TcpStream::connect(sa).await.map(Conn::Tcp),
                #[cfg(unix)]
                SockAddr::Unix(path) => UnixStream::connect(path).await.map(Conn::Unix),
            }
        })
    }
}
