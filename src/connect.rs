//! The asynchronous connect state machine -- the part of the pool that
//! actually hands a caller a usable [`Conn`], either by resurrecting an
//! idle one or by dialing fresh. Everything in [`pool`](crate::pool) is
//! bookkeeping this module drives.
//!
//! # Accounting
//!
//! Two counters are kept per attempt: a target's `request_count` (sockets
//! currently checked out against that target, idle or not) and the pool's
//! `outstanding` (sockets the pool has handed out or is still holding
//! idle). `request_count` goes up exactly once per target selection and
//! down exactly once when that socket's [`CloseGuard`] drops.
//! `outstanding` goes up only when a fresh dial is actually started (idle
//! reuse doesn't re-increment it -- the idle entry was already counted
//! when it was first connected) and down when the guard drops, unless
//! [`CloseGuard::disarm_outstanding`] was called first because the
//! connection is headed back to the idle list instead of being closed.
//!
//! A dead idle entry discovered by the liveness probe is simply dropped
//! without touching either counter: it was never counted as in flight
//! (only as idle, via `outstanding`), and `outstanding`'s only documented
//! decrement points are reaper expiry, dispose, and a guard's close path
//! -- not a checkout-time liveness failure. `capacity`/`outstanding` are
//! advisory only (see [`crate::config::Config`]), so the resulting drift
//! is cosmetic, not a correctness bug.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Once, Weak};
use std::task::{Context, Poll};

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::balancer::TargetSnapshot;
use crate::error::Error;
use crate::origin::{Origin, Peer, SockAddr};
use crate::pool::{add_target, destroy_expired_locked, lookup_target, pop_idle, Pool, Shared};
use crate::resolver::ResolveError;
use crate::rt::Conn;

static WARN_CLOSED: Once = Once::new();
static WARN_UNEXPECTED_DATA: Once = Once::new();

fn warn_closed_once() {
    WARN_CLOSED.call_once(|| {
        tracing::warn!("idle connection was closed by the peer before its timeout elapsed")
    });
}

fn warn_unexpected_data_once() {
    WARN_UNEXPECTED_DATA.call_once(|| {
        tracing::warn!("idle connection unexpectedly had buffered data on checkout")
    });
}

/// RAII accounting for one checked-out socket. Dropping it always pays off
/// the `request_count` increment taken at selection time, and -- unless
/// [`disarm_outstanding`](Self::disarm_outstanding) was called first --
/// also pays off the `outstanding` increment the socket represents.
pub(crate) struct CloseGuard {
    shared: Weak<Shared>,
    target: usize,
    dec_outstanding: std::cell::Cell<bool>,
}

impl CloseGuard {
    fn new(shared: &Arc<Shared>, target: usize) -> Self {
        CloseGuard {
            shared: Arc::downgrade(shared),
            target,
            dec_outstanding: std::cell::Cell::new(true),
        }
    }

    /// Call before returning a connection to the idle list: it stays
    /// counted as present, so only `request_count` should drop, not
    /// `outstanding`.
    pub(crate) fn disarm_outstanding(&self) {
        self.dec_outstanding.set(false);
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        {
            let locked = shared.locked.lock().unwrap();
            if let Some(t) = locked.targets.get(self.target) {
                t.request_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
        if self.dec_outstanding.get() {
            shared.outstanding.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// A connection checked out of the pool. Reads and writes go straight to
/// the underlying [`Conn`]; give it back with
/// [`Pool::return_connection`](crate::Pool::return_connection) when done,
/// or just drop it to close.
pub struct PooledConn {
    conn: Conn,
    target: usize,
    origin: Origin,
    guard: CloseGuard,
}

impl PooledConn {
    fn new(conn: Conn, target: usize, origin: Origin, guard: CloseGuard) -> Self {
        PooledConn {
            conn,
            target,
            origin,
            guard,
        }
    }

    /// The target this connection was checked out against.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub(crate) fn into_parts(self) -> (Conn, usize, CloseGuard) {
        (self.conn, self.target, self.guard)
    }
}

impl AsyncRead for PooledConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.conn).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.conn).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.conn).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.conn).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("target", &self.target)
            .field("origin", &self.origin)
            .finish()
    }
}

/// A checkout in progress. Polling it drives the connect state machine;
/// dropping it before completion cancels the attempt, same as dropping
/// any other future, but logs a trace so cancellations are visible.
pub struct Connecting {
    inner: Pin<Box<dyn Future<Output = Result<PooledConn, Error>> + Send>>,
    completed: bool,
}

impl Future for Connecting {
    type Output = Result<PooledConn, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.inner.as_mut().poll(cx) {
            Poll::Ready(out) => {
                self.completed = true;
                Poll::Ready(out)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Connecting {
    fn drop(&mut self) {
        if !self.completed {
            trace!("connect request dropped before completion");
        }
    }
}

impl Pool {
    /// Checks out a connection, reusing a live idle one if the target has
    /// one, dialing fresh otherwise. `url` selects (and, for a global
    /// pool, creates) the target; a specific pool ignores it and instead
    /// load balances across its fixed target list. `extra` is forwarded
    /// to the balancer untouched.
    pub fn connect(&self, url: Option<Origin>, extra: Option<Arc<dyn Any + Send + Sync>>) -> Connecting {
        let shared = self.shared.clone();
        Connecting {
            inner: Box::pin(connect_inner(shared, url, extra)),
            completed: false,
        }
    }
}

enum Selection {
    /// A global pool always has exactly one eligible target: the one
    /// just looked up or created for this URL.
    Fixed(usize),
    /// A specific pool picks among all configured targets, tracking
    /// which ones this attempt has already tried.
    Balanced(BitVec<usize, Lsb0>),
}

async fn connect_inner(
    shared: Arc<Shared>,
    url: Option<Origin>,
    extra: Option<Arc<dyn Any + Send + Sync>>,
) -> Result<PooledConn, Error> {
    let mut selection = {
        let mut locked = shared.locked.lock().unwrap();
        destroy_expired_locked(&shared, &mut locked);
        if shared.is_global {
            let url = url.ok_or(Error::Disabled)?;
            let idx = lookup_target(&locked, &url).unwrap_or_else(|| add_target(&mut locked, url));
            Selection::Fixed(idx)
        } else {
            if locked.targets.is_empty() {
                return Err(Error::Disabled);
            }
            Selection::Balanced(BitVec::repeat(false, locked.targets.len()))
        }
    };

    let total_attempts = match &selection {
        Selection::Fixed(_) => 1,
        Selection::Balanced(tried) => tried.len(),
    };
    let mut attempts_left = total_attempts;

    loop {
        let target = match &mut selection {
            Selection::Fixed(idx) => *idx,
            Selection::Balanced(tried) => select_target(&shared, tried, extra.as_deref()),
        };

        {
            let locked = shared.locked.lock().unwrap();
            locked.targets[target].request_count.fetch_add(1, Ordering::Relaxed);
        }
        let guard = CloseGuard::new(&shared, target);

        if let Some(conn) = try_idle_reuse(&shared, target) {
            let origin = shared.locked.lock().unwrap().targets[target].origin.clone();
            return Ok(PooledConn::new(conn, target, origin, guard));
        }

        shared.outstanding.fetch_add(1, Ordering::Relaxed);
        let peer = shared.locked.lock().unwrap().targets[target].peer.clone();

        let dial = dial_peer(&shared, peer).await;
        attempts_left -= 1;

        match dial {
            Ok(conn) => {
                let origin = shared.locked.lock().unwrap().targets[target].origin.clone();
                tracing::debug!(target, "connected");
                return Ok(PooledConn::new(conn, target, origin, guard));
            }
            // Resolution failure is terminal: it says nothing about
            // whether *other* targets are reachable, so it isn't retried
            // and is reported as its own error kind rather than folded
            // into the generic connect-failed/retries-exhausted pair.
            Err(DialError::Resolve(e)) => {
                drop(guard);
                tracing::debug!(target, error = %e, "resolution failed");
                return Err(Error::Resolve(e.to_string()));
            }
            Err(DialError::Connect(e)) if attempts_left == 0 => {
                drop(guard);
                tracing::debug!(target, error = %e, "connect failed, no targets left to try");
                return Err(if total_attempts <= 1 {
                    Error::ConnectFailed
                } else {
                    Error::RetriesExhausted
                });
            }
            Err(DialError::Connect(e)) => {
                drop(guard);
                tracing::debug!(target, error = %e, "connect failed, retrying another target");
                continue;
            }
        }
    }
}

fn select_target(
    shared: &Arc<Shared>,
    tried: &mut BitVec<usize, Lsb0>,
    extra: Option<&(dyn Any + Send + Sync)>,
) -> usize {
    let locked = shared.locked.lock().unwrap();
    let idx = match &shared.balancer {
        Some(balancer) => {
            let snapshots: Vec<TargetSnapshot<'_>> = locked
                .targets
                .iter()
                .map(|t| TargetSnapshot {
                    origin: &t.origin,
                    request_count: t.request_count.load(Ordering::Relaxed),
                })
                .collect();
            balancer.select(&snapshots, tried, extra)
        }
        None => 0,
    };
    assert!(
        !tried[idx],
        "balancer selected an already-tried target index {idx}"
    );
    tried.set(idx, true);
    idx
}

/// Pops this target's idle entries (LIFO) until one passes the liveness
/// probe or the list runs out. Entries that fail the probe are logged
/// once per kind and dropped without touching either counter.
fn try_idle_reuse(shared: &Arc<Shared>, target: usize) -> Option<Conn> {
    loop {
        let popped = {
            let mut locked = shared.locked.lock().unwrap();
            pop_idle(&mut locked, target)
        };
        let (_, entry) = popped?;
        match entry.conn.peek_probe() {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Some(entry.conn),
            Ok(0) => {
                warn_closed_once();
                trace!(target, "discarding idle connection closed by peer");
            }
            Ok(_) => {
                warn_unexpected_data_once();
                trace!(target, "discarding idle connection with unexpected data");
            }
            Err(_) => {
                warn_closed_once();
                trace!(target, "discarding idle connection after probe error");
            }
        }
    }
}

/// A failed dial, split by which collaborator failed: resolution failures
/// are terminal (spec §4.4 Step 4, §7 error kind 1 -- "connection failed"
/// to `Error::Resolve` is not a per-target retry, it's a hard stop), while
/// a post-resolution connect failure is the ordinary per-target failure
/// that the retry loop consults `attempts_left` for.
enum DialError {
    Resolve(ResolveError),
    Connect(std::io::Error),
}

async fn dial_peer(shared: &Arc<Shared>, peer: Peer) -> Result<Conn, DialError> {
    let addr = match peer {
        Peer::Sock(sock) => sock,
        Peer::Named { host, service } => {
            let port: u16 = service.parse().unwrap_or(0);
            let addrs = shared
                .resolver
                .resolve(host, port)
                .await
                .map_err(DialError::Resolve)?;
            SockAddr::Tcp(crate::resolver::select_one(&addrs))
        }
    };
    shared.connector.connect(addr).await.map_err(DialError::Connect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::origin::Scheme;
    use crate::resolver::SystemResolver;
    use crate::rt::TokioConnector;

    #[tokio::test]
    async fn connect_then_reuse_after_return() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((_sock, _)) = listener.accept().await else {
                    return;
                };
            }
        });

        let pool = Pool::init_specific(
            Config::default(),
            vec![Origin::tcp(Scheme::Http, addr.ip().to_string(), addr.port())],
            None,
            vec![],
            Arc::new(SystemResolver),
            Arc::new(TokioConnector),
        );

        let conn = pool.connect(None, None).await.unwrap();
        assert_eq!(pool.stats().outstanding, 1);
        pool.return_connection(conn).unwrap();
        assert_eq!(pool.stats().outstanding, 1);

        let conn2 = pool.connect(None, None).await.unwrap();
        assert_eq!(pool.stats().outstanding, 1);
        drop(conn2);
    }

    #[tokio::test]
    async fn connect_fails_when_nothing_listens() {
        let pool = Pool::init_specific(
            Config::default(),
            vec![Origin::tcp(Scheme::Http, "127.0.0.1", 1)],
            None,
            vec![],
            Arc::new(SystemResolver),
            Arc::new(TokioConnector),
        );
        let err = pool.connect(None, None).await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed));
    }

    #[tokio::test]
    async fn global_pool_requires_a_url() {
        let pool = Pool::init_global(Config::default(), Arc::new(SystemResolver), Arc::new(TokioConnector));
        let err = pool.connect(None, None).await.unwrap_err();
        assert!(matches!(err, Error::Disabled));
    }

    struct AlwaysFailsResolver {
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl crate::resolver::Resolver for AlwaysFailsResolver {
        fn resolve(
            &self,
            _host: String,
            _port: u16,
        ) -> futures_util::future::BoxFuture<'static, Result<Vec<std::net::SocketAddr>, ResolveError>>
        {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Box::pin(async { Err(ResolveError("no such host".into())) })
        }
    }

    #[tokio::test]
    async fn resolution_failure_is_terminal_and_not_retried() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let pool = Pool::init_specific(
            Config::default(),
            vec![
                Origin::tcp(Scheme::Http, "host-a.example", 80),
                Origin::tcp(Scheme::Http, "host-b.example", 80),
            ],
            Some(Arc::new(crate::balancer::RoundRobin::new()) as Arc<dyn crate::balancer::Balancer>),
            vec![],
            Arc::new(AlwaysFailsResolver { calls: calls.clone() }),
            Arc::new(TokioConnector),
        );

        let err = pool.connect(None, None).await.unwrap_err();
        assert!(matches!(err, Error::Resolve(_)));
        assert_eq!(calls.load(Ordering::Relaxed), 1, "must not retry other targets after a resolve failure");
    }
}
