//! The asynchronous name resolution collaborator. `connect` submits a
//! `(host, port)` request and awaits a set of addresses; which one gets
//! used is the resolver's call, not the pool's.

use std::net::SocketAddr;

use futures_util::future::BoxFuture;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ResolveError(pub String);

pub trait Resolver: Send + Sync {
    fn resolve(&self, host: String, port: u16) -> BoxFuture<'static, Result<Vec<SocketAddr>, ResolveError>>;
}

/// Picks one address from a resolved set. The pool always asks for a
/// single address up front (matching a getaddrinfo-style "pick one and
/// go" contract); a resolver free to do its own Happy-Eyeballs-style
/// racing would instead return a single already-raced address here.
pub fn select_one(addrs: &[SocketAddr]) -> SocketAddr {
    addrs[0]
}

/// Default resolver backed by the system's resolver via `tokio::net`.
/// Used whenever the `hickory` feature isn't enabled, so the crate is
/// usable with zero extra dependencies.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: String, port: u16) -> BoxFuture<'static, Result<Vec<SocketAddr>, ResolveError>> {
        Box::pin(async move {
            tokio::net::lookup_host((host.as_str(), port))
                .await
                .map(|addrs| addrs.collect())
                .map_err(|e| ResolveError(e.to_string()))
        })
    }
}

#[cfg(feature = "hickory")]
mod hickory_impl {
    use super::*;
    use hickory_resolver::TokioAsyncResolver;

    /// Resolver backed by the hickory-dns stack, for deployments that want
    /// a pure-Rust resolver independent of the system's `getaddrinfo`.
    pub struct HickoryResolver {
        inner: TokioAsyncResolver,
    }

    impl HickoryResolver {
        pub fn from_system_conf() -> Result<Self, hickory_resolver::error::ResolveError> {
            Ok(HickoryResolver {
                inner: TokioAsyncResolver::tokio_from_system_conf()?,
            })
        }
    }

    impl Resolver for HickoryResolver {
        fn resolve(
            &self,
            host: String,
            port: u16,
        ) -> BoxFuture<'static, Result<Vec<SocketAddr>, ResolveError>> {
            let inner = self.inner.clone();
            Box::pin(async move {
                let lookup = inner
                    .lookup_ip(host.as_str())
                    .await
                    .map_err(|e| ResolveError(e.to_string()))?;
                let addrs: Vec<SocketAddr> =
                    lookup.iter().map(|ip| SocketAddr::new(ip, port)).collect();
                if addrs.is_empty() {
                    return Err(ResolveError(format!("no addresses found for {host}")));
                }
                Ok(addrs)
            })
        }
    }
}

#[cfg(feature = "hickory")]
pub use hickory_impl::HickoryResolver;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_one_picks_first() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        assert_eq!(select_one(&[a, b]), a);
    }
}
