//! A reusable outbound connection pool: keep-alive sockets to one or more
//! backend targets, with idle-entry expiration, optional load balancing
//! across targets, and pluggable name resolution and dialing.
//!
//! Two shapes are supported, mirroring [`Pool::init_specific`] and
//! [`Pool::init_global`]:
//!
//! - a **specific** pool is built with a fixed target list and, when it
//!   has more than one target, a [`Balancer`] to pick among them;
//! - a **global** pool starts empty and grows a target the first time a
//!   new origin is requested, with no balancing (one URL, one target).
//!
//! ```no_run
//! use std::sync::Arc;
//! use sockpool::{Config, Origin, Pool, Scheme, SystemResolver, TokioConnector};
//!
//! # async fn run() -> Result<(), sockpool::Error> {
//! let pool = Pool::init_specific(
//!     Config::default(),
//!     vec![Origin::tcp(Scheme::Http, "backend.internal", 8080)],
//!     None,
//!     vec![],
//!     Arc::new(SystemResolver),
//!     Arc::new(TokioConnector),
//! );
//! pool.register();
//!
//! let conn = pool.connect(None, None).await?;
//! // ... use `conn` as an AsyncRead + AsyncWrite ...
//! pool.return_connection(conn).ok();
//! # Ok(())
//! # }
//! ```
//!
//! What this crate deliberately leaves to its caller: capacity
//! enforcement (the `capacity`/`outstanding` counters are advisory), TLS,
//! request admission control, URL parsing, and the event loop itself
//! (it runs on the ambient Tokio runtime, it doesn't own one).

mod balancer;
mod config;
mod connect;
mod error;
mod origin;
mod pool;
mod resolver;
mod rt;

pub use balancer::{Balancer, Random, RoundRobin, TargetSnapshot};
pub use config::{Config, DEFAULT_IDLE_TIMEOUT};
pub use connect::{Connecting, PooledConn};
pub use error::{Error, ReturnError};
pub use origin::{Origin, Scheme};
pub use pool::{Pool, Stats};
pub use resolver::{ResolveError, Resolver, SystemResolver};
pub use rt::{Conn, Connector, TokioConnector};

#[cfg(feature = "hickory")]
pub use resolver::HickoryResolver;
