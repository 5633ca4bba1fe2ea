//! Listening sockets: bound once by the supervisor, adopted by every worker.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use log::info;
use tokio::net::TcpListener;

use crate::error::{BindError, WorkerError};

/// Named listening sockets owned by the supervisor for its whole lifetime.
///
/// Never mutated after [`preallocate`]; every worker generation receives the
/// same descriptors, so overlapping generations accept on one shared queue.
#[derive(Debug)]
pub struct ListeningSockets {
    sockets: BTreeMap<String, StdTcpListener>,
}

impl ListeningSockets {
    /// Name and raw descriptor of every socket, in name order.
    pub fn descriptors(&self) -> impl Iterator<Item = (&str, RawFd)> {
        self.sockets
            .iter()
            .map(|(name, listener)| (name.as_str(), listener.as_raw_fd()))
    }

    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.sockets.get(name)?.local_addr().ok()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

/// Binds one wildcard TCP listener per `name → port` entry.
///
/// Any failure aborts the whole set; sockets bound so far are closed.
pub fn preallocate(ports: &BTreeMap<String, u16>) -> Result<ListeningSockets, BindError> {
    let mut sockets = BTreeMap::new();
    for (name, &port) in ports {
        let listener = StdTcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(|source| {
            BindError::Bind {
                name: name.clone(),
                port,
                source,
            }
        })?;
        info!(
            "preallocated listener '{name}' on {}",
            listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| format!("port {port}"))
        );
        sockets.insert(name.clone(), listener);
    }
    Ok(ListeningSockets { sockets })
}

/// Turns inherited `name → fd` entries into tokio listeners.
///
/// Must be called from within a tokio runtime, at most once per descriptor.
pub fn adopt_listeners(
    fds: &BTreeMap<String, RawFd>,
) -> Result<BTreeMap<String, TcpListener>, WorkerError> {
    let mut listeners = BTreeMap::new();
    for (name, &fd) in fds {
        if !is_socket(fd) {
            return Err(WorkerError::NotASocket {
                name: name.clone(),
                fd,
            });
        }
        // SAFETY: fstat confirmed `fd` is an open socket, and the supervisor
        // handed it to this process exclusively under this name.
        let std_listener = unsafe { StdTcpListener::from_raw_fd(fd) };
        let adopt = |source| WorkerError::Adopt {
            name: name.clone(),
            source,
        };
        std_listener.set_nonblocking(true).map_err(adopt)?;
        let listener = TcpListener::from_std(std_listener).map_err(adopt)?;
        info!(
            "adopted listener '{name}' from fd {fd} ({:?})",
            listener.local_addr().ok()
        );
        listeners.insert(name.clone(), listener);
    }
    Ok(listeners)
}

fn is_socket(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports(entries: &[(&str, u16)]) -> BTreeMap<String, u16> {
        entries
            .iter()
            .map(|(name, port)| (name.to_string(), *port))
            .collect()
    }

    #[test]
    fn test_preallocate_binds_every_entry() {
        let sockets = preallocate(&ports(&[("web", 0), ("metrics", 0)])).unwrap();
        assert_eq!(sockets.len(), 2);
        let names: Vec<&str> = sockets.descriptors().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["metrics", "web"]);
        assert!(sockets.local_addr("web").unwrap().ip().is_unspecified());
        assert!(sockets.local_addr("missing").is_none());
    }

    #[test]
    fn test_preallocate_fails_fast_on_conflict() {
        let taken = StdTcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = preallocate(&ports(&[("a", 0), ("b", port)])).unwrap_err();
        match err {
            BindError::Bind { name, port: p, .. } => {
                assert_eq!(name, "b");
                assert_eq!(p, port);
            }
        }
    }

    #[tokio::test]
    async fn test_adopt_reconstructs_listener_on_same_port() {
        let sockets = preallocate(&ports(&[("web", 0)])).unwrap();
        let addr = sockets.local_addr("web").unwrap();
        let (_, fd) = sockets.descriptors().next().unwrap();

        let dup = unsafe { libc::dup(fd) };
        assert!(dup >= 0);
        let fds = BTreeMap::from([("web".to_string(), dup)]);
        let adopted = adopt_listeners(&fds).unwrap();

        let listener = &adopted["web"];
        assert_eq!(listener.local_addr().unwrap().port(), addr.port());
        let connect = tokio::net::TcpStream::connect(("127.0.0.1", addr.port()));
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        assert!(accepted.is_ok());
        assert!(connected.is_ok());
    }

    #[tokio::test]
    async fn test_adopt_rejects_non_socket() {
        let fds = BTreeMap::from([("web".to_string(), 9999)]);
        let err = adopt_listeners(&fds).unwrap_err();
        assert!(matches!(err, WorkerError::NotASocket { fd: 9999, .. }));
    }
}
