use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Scheme of a target origin. Kept deliberately small: this crate does not
/// parse arbitrary URLs (that's an external concern), callers build an
/// [`Origin`] from already-split parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Host {
    Name(String),
    Unix(PathBuf),
}

/// A backend origin: scheme + host (or Unix socket path) + port.
///
/// Two origins are target-equivalent when scheme, port, and host compare
/// equal after normalization (host lowercased, except for a Unix path).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: Scheme,
    pub(crate) host: Host,
    pub port: u16,
}

impl Origin {
    /// A TCP origin identified by hostname or literal IP.
    pub fn tcp(scheme: Scheme, host: impl AsRef<str>, port: u16) -> Self {
        Origin {
            scheme,
            host: Host::Name(host.as_ref().to_ascii_lowercase()),
            port,
        }
    }

    /// A Unix domain socket origin. The path is kept byte-exact: unlike a
    /// hostname it is case-sensitive on the filesystems that matter.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Origin {
            scheme: Scheme::Http,
            host: Host::Unix(path.into()),
            port: 0,
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self.host, Host::Unix(_))
    }

    pub fn host_str(&self) -> Option<&str> {
        match &self.host {
            Host::Name(h) => Some(h),
            Host::Unix(_) => None,
        }
    }
}

/// What kind of peer a target resolves to, mirroring the NAMED/SOCKADDR
/// split: a literal IP (or Unix path) needs no resolver round trip, a
/// hostname does.
#[derive(Clone, Debug)]
pub(crate) enum Peer {
    Named { host: String, service: String },
    Sock(SockAddr),
}

#[derive(Clone, Debug)]
pub(crate) enum SockAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

pub(crate) fn detect_peer(origin: &Origin) -> Peer {
    match &origin.host {
        Host::Unix(path) => {
            #[cfg(unix)]
            {
                Peer::Sock(SockAddr::Unix(path.clone()))
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                unreachable!("unix-domain targets are only constructible on unix")
            }
        }
        Host::Name(host) => match host.parse::<IpAddr>() {
            Ok(ip) => Peer::Sock(SockAddr::Tcp(SocketAddr::new(ip, origin.port))),
            Err(_) => Peer::Named {
                host: host.clone(),
                service: origin.port.to_string(),
            },
        },
    }
}

/// Equality used by `lookup_target`: scheme, port, and host must all match.
pub(crate) fn origins_equivalent(a: &Origin, b: &Origin) -> bool {
    a.scheme == b.scheme && a.port == b.port && a.host == b.host
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_vs_literal_ip() {
        let named = Origin::tcp(Scheme::Http, "example.com", 80);
        assert!(matches!(detect_peer(&named), Peer::Named { .. }));

        let literal = Origin::tcp(Scheme::Http, "127.0.0.1", 8080);
        assert!(matches!(detect_peer(&literal), Peer::Sock(SockAddr::Tcp(_))));
    }

    #[test]
    fn host_is_lowercased_but_unix_path_is_not() {
        let o = Origin::tcp(Scheme::Http, "ExAmple.COM", 80);
        assert_eq!(o.host_str(), Some("example.com"));

        let u = Origin::unix("/tmp/Upstream.sock");
        assert!(matches!(&u.host, Host::Unix(p) if p.to_str() == Some("/tmp/Upstream.sock")));
    }

    #[test]
    fn lookup_equivalence_requires_scheme_port_host() {
        let a = Origin::tcp(Scheme::Http, "a", 80);
        let b = Origin::tcp(Scheme::Http, "A", 80);
        let c = Origin::tcp(Scheme::Http, "a", 81);
        assert!(origins_equivalent(&a, &b));
        assert!(!origins_equivalent(&a, &c));
    }
}
