use std::any::Any;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures_channel::oneshot;
use slab::Slab;
use tracing::{debug, trace};

use crate::balancer::Balancer;
use crate::config::Config;
use crate::connect::PooledConn;
use crate::error::ReturnError;
use crate::origin::{detect_peer, origins_equivalent, Origin, Peer};
use crate::resolver::Resolver;
use crate::rt::{Conn, Connector};

/// Minimum gap between reaper ticks, regardless of how small a configured
/// idle timeout is. Mirrors the teacher's own `MIN_CHECK`: a 1ms idle
/// timeout shouldn't make the reaper spin.
pub(crate) const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(90);

/// How often the reaper wakes up to scan for expired entries when the
/// idle timeout allows a coarser cadence than `MIN_CHECK_INTERVAL`.
const REAPER_TICK: Duration = Duration::from_millis(1000);

pub(crate) struct EntryRecord {
    pub(crate) conn: Conn,
    pub(crate) target: usize,
    pub(crate) added_at: Instant,
}

pub(crate) struct TargetState {
    pub(crate) origin: Origin,
    pub(crate) peer: Peer,
    pub(crate) balancer_datum: Option<Arc<dyn Any + Send + Sync>>,
    /// Per-target idle index: LIFO, most-recently-returned entry id last.
    pub(crate) idle: Vec<usize>,
    pub(crate) request_count: AtomicUsize,
}

pub(crate) struct Locked {
    pub(crate) targets: Vec<TargetState>,
    /// Arena of idle entries keyed by a stable id, shared between the
    /// pool-wide FIFO and each target's LIFO index so neither needs raw
    /// intrusive pointers.
    pub(crate) entries: Slab<EntryRecord>,
    /// Pool-wide FIFO: pushed at the back on insert, drained from the
    /// front by the reaper. Every id here also appears in exactly one
    /// `TargetState::idle`.
    pub(crate) pool_fifo: VecDeque<usize>,
}

pub(crate) struct Shared {
    pub(crate) locked: Mutex<Locked>,
    pub(crate) outstanding: AtomicUsize,
    pub(crate) config: Config,
    pub(crate) is_global: bool,
    pub(crate) balancer: Option<Arc<dyn Balancer>>,
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) connector: Arc<dyn Connector>,
    reaper: Mutex<Option<oneshot::Sender<Infallible>>>,
}

/// A keep-alive connection pool: either `specific` (a fixed set of
/// targets, load balanced) or `global` (grows on demand, one target per
/// distinct origin seen).
#[derive(Clone)]
pub struct Pool {
    pub(crate) shared: Arc<Shared>,
}

/// Snapshot of the pool-wide counters. Read without the mutex -- these are
/// hints, not a consistent point-in-time view across both fields.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub outstanding: usize,
    pub capacity: usize,
}

impl Pool {
    /// A pool with a fixed target list, load balanced when more than one
    /// target is configured.
    pub fn init_specific(
        config: Config,
        origins: Vec<Origin>,
        balancer: Option<Arc<dyn Balancer>>,
        balancer_data: Vec<Option<Arc<dyn Any + Send + Sync>>>,
        resolver: Arc<dyn Resolver>,
        connector: Arc<dyn Connector>,
    ) -> Pool {
        assert!(!origins.is_empty(), "a specific pool needs at least one target");
        let mut targets = Vec::with_capacity(origins.len());
        for (i, origin) in origins.into_iter().enumerate() {
            let datum = balancer_data.get(i).cloned().flatten();
            targets.push(init_target(origin, datum));
        }
        let balancer = if targets.len() > 1 { balancer } else { None };
        Pool {
            shared: Arc::new(common_init(targets, config, false, balancer, resolver, connector)),
        }
    }

    /// An initially-empty pool that grows a target the first time a new
    /// origin is requested. Never load balanced: a given URL always maps
    /// to exactly one target.
    pub fn init_global(config: Config, resolver: Arc<dyn Resolver>, connector: Arc<dyn Connector>) -> Pool {
        Pool {
            shared: Arc::new(common_init(Vec::new(), config, true, None, resolver, connector)),
        }
    }

    pub fn can_keepalive(&self) -> bool {
        self.shared.config.can_keepalive()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            outstanding: self.shared.outstanding.load(Ordering::Relaxed),
            capacity: self.shared.config.capacity,
        }
    }

    /// Binds the pool's expiration reaper to the ambient Tokio runtime.
    /// Idempotent: a second call while a reaper is already running is a
    /// no-op, matching `register_loop`'s binding rule.
    pub fn register(&self) {
        let mut reaper = self.shared.reaper.lock().unwrap();
        if reaper.is_some() {
            return;
        }
        if self.shared.config.idle_timeout.is_zero() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        *reaper = Some(tx);
        let tick = REAPER_TICK.max(MIN_CHECK_INTERVAL);
        tokio::spawn(reap_loop(Arc::downgrade(&self.shared), tick, rx));
    }

    /// Cancels the reaper task. A no-op if none is running.
    pub fn unregister(&self) {
        let mut reaper = self.shared.reaper.lock().unwrap();
        *reaper = None; // dropping the sender wakes the reaper's select and it exits
    }

    /// Gives a previously checked-out connection back to the pool for
    /// reuse. On failure the connection is simply dropped (closed); the
    /// outstanding counter already reflects that a socket is going away.
    pub fn return_connection(&self, pooled: PooledConn) -> Result<(), ReturnError> {
        let (conn, target, guard) = pooled.into_parts();

        let mut locked = self.shared.locked.lock().unwrap();
        destroy_expired_locked(&self.shared, &mut locked);

        let cap = self.shared.config.max_idle_per_target;
        if locked.targets[target].idle.len() >= cap {
            drop(locked);
            trace!(target, "max idle per target reached, dropping connection");
            drop(conn);
            // Over the cap: this connection is being closed, not pooled,
            // so the guard's ordinary close path (decrementing both
            // request_count and outstanding) is exactly right -- leave it
            // armed.
            drop(guard);
            return Ok(());
        }

        // Reinserting as idle: this connection stays counted as
        // "present", so only `request_count` should drop when this guard
        // eventually runs, not `outstanding`. Disarm while still holding
        // the lock (it only flips a flag); the guard itself isn't
        // dropped until after the lock is released below, since its Drop
        // impl also locks `self.shared.locked`.
        guard.disarm_outstanding();

        let id = locked.entries.insert(EntryRecord {
            conn,
            target,
            added_at: Instant::now(),
        });
        locked.targets[target].idle.push(id);
        locked.pool_fifo.push_back(id);
        drop(locked);
        drop(guard);
        debug!(target, "returned connection to pool");
        Ok(())
    }

    /// Drains all idle entries and stops the reaper.
    pub fn dispose(&self) {
        self.unregister();
        let mut locked = self.shared.locked.lock().unwrap();
        drain_idle_locked(&self.shared, &mut locked);
    }
}

fn init_target(origin: Origin, balancer_datum: Option<Arc<dyn Any + Send + Sync>>) -> TargetState {
    let peer = detect_peer(&origin);
    TargetState {
        origin,
        peer,
        balancer_datum,
        idle: Vec::new(),
        request_count: AtomicUsize::new(0),
    }
}

fn common_init(
    targets: Vec<TargetState>,
    config: Config,
    is_global: bool,
    balancer: Option<Arc<dyn Balancer>>,
    resolver: Arc<dyn Resolver>,
    connector: Arc<dyn Connector>,
) -> Shared {
    Shared {
        locked: Mutex::new(Locked {
            targets,
            entries: Slab::new(),
            pool_fifo: VecDeque::new(),
        }),
        outstanding: AtomicUsize::new(0),
        config,
        is_global,
        balancer,
        resolver,
        connector,
        reaper: Mutex::new(None),
    }
}

/// Linear scan for a target whose origin is equivalent to `url`. Called
/// with the mutex held, same as the source's `lookup_target`.
pub(crate) fn lookup_target(locked: &Locked, url: &Origin) -> Option<usize> {
    locked
        .targets
        .iter()
        .position(|t| origins_equivalent(&t.origin, url))
}

/// Appends a new target to a global pool. Caller must hold the mutex:
/// global-pool growth races with concurrent `connect` calls on other
/// threads.
pub(crate) fn add_target(locked: &mut Locked, url: Origin) -> usize {
    locked.targets.push(init_target(url, None));
    locked.targets.len() - 1
}

/// Drops every idle entry whose age exceeds the configured timeout.
/// Caller must hold the mutex. A no-op (not just idempotent-after-first-
/// call, genuinely inert) if called twice with no time advance, since the
/// second call simply finds the FIFO head already younger than the cutoff
/// or the queue empty.
pub(crate) fn destroy_expired_locked(shared: &Shared, locked: &mut Locked) {
    let timeout = shared.config.idle_timeout;
    if timeout.is_zero() {
        return;
    }
    let cutoff = Instant::now().checked_sub(timeout);
    let Some(cutoff) = cutoff else { return };

    while let Some(&id) = locked.pool_fifo.front() {
        let expired = locked
            .entries
            .get(id)
            .map(|e| e.added_at <= cutoff)
            .unwrap_or(true);
        if !expired {
            break;
        }
        locked.pool_fifo.pop_front();
        if let Some(entry) = locked.entries.try_remove(id) {
            if let Some(t) = locked.targets.get_mut(entry.target) {
                t.idle.retain(|&e| e != id);
            }
            shared.outstanding.fetch_sub(1, Ordering::Relaxed);
            trace!(target = entry.target, "reaped expired idle connection");
        }
    }
}

fn drain_idle_locked(shared: &Shared, locked: &mut Locked) {
    while let Some(id) = locked.pool_fifo.pop_front() {
        if locked.entries.try_remove(id).is_some() {
            shared.outstanding.fetch_sub(1, Ordering::Relaxed);
        }
    }
    for t in &mut locked.targets {
        t.idle.clear();
    }
}

async fn reap_loop(pool: Weak<Shared>, dur: Duration, mut drop_signal: oneshot::Receiver<Infallible>) {
    use futures_util::future::{select, Either};

    loop {
        let sleep = tokio::time::sleep(dur);
        tokio::pin!(sleep);
        match select(&mut drop_signal, sleep).await {
            Either::Left(_) => {
                trace!("pool reaper stopping: unregistered");
                return;
            }
            Either::Right(_) => {
                let Some(shared) = pool.upgrade() else {
                    return;
                };
                if let Ok(mut locked) = shared.locked.try_lock() {
                    destroy_expired_locked(&shared, &mut locked);
                } else {
                    trace!("pool reaper skipped a tick: pool busy");
                }
            }
        }
    }
}

/// Removes and returns the single id at the head of `idle` (checked out
/// for reuse), unlinking it from the pool-wide FIFO as well. `O(n)` in the
/// FIFO length, which is fine: checkout racing the reaper is the cold
/// path, counters are the hot one (see the crate's design notes).
pub(crate) fn pop_idle(locked: &mut Locked, target: usize) -> Option<(usize, EntryRecord)> {
    let id = locked.targets[target].idle.pop()?;
    if let Some(pos) = locked.pool_fifo.iter().position(|&e| e == id) {
        locked.pool_fifo.remove(pos);
    }
    let entry = locked.entries.remove(id);
    Some((id, entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::Scheme;
    use crate::resolver::SystemResolver;
    use crate::rt::TokioConnector;

    fn test_pool(origins: Vec<Origin>) -> Pool {
        Pool::init_specific(
            Config::default(),
            origins,
            None,
            vec![],
            Arc::new(SystemResolver),
            Arc::new(TokioConnector),
        )
    }

    #[test]
    fn single_target_has_no_balancer() {
        let pool = test_pool(vec![Origin::tcp(Scheme::Http, "a", 80)]);
        assert!(pool.shared.balancer.is_none());
    }

    #[test]
    fn lookup_target_matches_equivalent_origin() {
        let pool = test_pool(vec![Origin::tcp(Scheme::Http, "a", 80)]);
        let locked = pool.shared.locked.lock().unwrap();
        assert_eq!(
            lookup_target(&locked, &Origin::tcp(Scheme::Http, "A", 80)),
            Some(0)
        );
        assert_eq!(lookup_target(&locked, &Origin::tcp(Scheme::Http, "a", 81)), None);
    }

    #[tokio::test]
    async fn destroy_expired_is_idempotent_with_no_time_advance() {
        tokio::time::pause();
        let pool = test_pool(vec![Origin::tcp(Scheme::Http, "a", 80)]);
        {
            let mut locked = pool.shared.locked.lock().unwrap();
            locked.targets[0].idle.push(
                locked.entries.insert(EntryRecord {
                    conn: dummy_conn(),
                    target: 0,
                    added_at: Instant::now(),
                }),
            );
            let id = *locked.targets[0].idle.last().unwrap();
            locked.pool_fifo.push_back(id);
        }
        pool.shared.outstanding.store(1, Ordering::Relaxed);

        tokio::time::advance(Duration::from_millis(5000)).await;
        {
            let mut locked = pool.shared.locked.lock().unwrap();
            destroy_expired_locked(&pool.shared, &mut locked);
        }
        let after_first = pool.shared.outstanding.load(Ordering::Relaxed);
        {
            let mut locked = pool.shared.locked.lock().unwrap();
            destroy_expired_locked(&pool.shared, &mut locked);
        }
        let after_second = pool.shared.outstanding.load(Ordering::Relaxed);
        assert_eq!(after_first, 0);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn register_reaps_expired_entry_through_spawned_task() {
        tokio::time::pause();
        let pool = test_pool(vec![Origin::tcp(Scheme::Http, "a", 80)]);
        {
            let mut locked = pool.shared.locked.lock().unwrap();
            let id = locked.entries.insert(EntryRecord {
                conn: dummy_conn(),
                target: 0,
                added_at: Instant::now(),
            });
            locked.targets[0].idle.push(id);
            locked.pool_fifo.push_back(id);
        }
        pool.shared.outstanding.store(1, Ordering::Relaxed);

        pool.register();

        // Default idle timeout is 2000ms, reaper ticks every 1000ms; drive
        // the paused clock across several ticks, yielding after each so
        // the spawned reaper task (not a bare `destroy_expired_locked`
        // call) actually wakes, re-arms its sleep, and runs.
        for _ in 0..4 {
            tokio::time::advance(Duration::from_millis(1000)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(pool.shared.outstanding.load(Ordering::Relaxed), 0);
        {
            let locked = pool.shared.locked.lock().unwrap();
            assert!(locked.targets[0].idle.is_empty());
            assert!(locked.pool_fifo.is_empty());
        }

        pool.unregister();
    }

    fn dummy_conn() -> Conn {
        // Constructed lazily only inside a Tokio runtime by callers of
        // this helper; tests that use it run under #[tokio::test].
        use std::net::{Ipv4Addr, SocketAddr};
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let std_listener = std::net::TcpListener::bind(addr).unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
        let local = listener.local_addr().unwrap();
        let std_stream = std::net::TcpStream::connect(local).unwrap();
        std_stream.set_nonblocking(true).unwrap();
        Conn::Tcp(tokio::net::TcpStream::from_std(std_stream).unwrap())
    }
}
