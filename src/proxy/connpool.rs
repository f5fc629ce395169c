//! Persistent upstream connection pool.
//!
//! Two parallel slot arrays (active and backup) of equal capacity. A slot
//! is one reusable upstream socket plus a reservation mark; a session that
//! assigns a slot takes the socket out and returns it at close. The
//! failover switch clears every reservation, so a session draining across
//! a switch finds its mark gone and drops the socket instead of returning
//! it.

use crate::error::ProxyError;
use crate::proxy::env::Role;
use mio::net::TcpStream;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

struct PoolSlot {
    stream: Option<TcpStream>,
    mark: bool,
}

struct Pools {
    active: Vec<PoolSlot>,
    backup: Vec<PoolSlot>,
}

pub struct ConnPool {
    inner: Mutex<Pools>,
    /// Round-robin scan start so no slot is starved.
    cursor: AtomicUsize,
    capacity: usize,
}

impl ConnPool {
    pub fn new(capacity: usize) -> Self {
        let mk = || {
            (0..capacity)
                .map(|_| PoolSlot {
                    stream: None,
                    mark: false,
                })
                .collect()
        };
        Self {
            inner: Mutex::new(Pools {
                active: mk(),
                backup: mk(),
            }),
            cursor: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve a free slot of the role's array and take its socket,
    /// connecting a fresh one to `endpoint` when the slot is empty.
    ///
    /// Returns `None` when every slot is reserved (the caller then opens
    /// an ephemeral upstream outside the pool) or when the reconnect
    /// fails outright.
    pub fn assign(&self, role: Role, endpoint: SocketAddr) -> Option<(usize, TcpStream)> {
        if self.capacity == 0 {
            return None;
        }
        let mut pools = self.inner.lock().unwrap();
        let slots = match role {
            Role::Active => &mut pools.active,
            Role::Backup => &mut pools.backup,
        };

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % self.capacity;
        for offset in 0..self.capacity {
            let i = (start + offset) % self.capacity;
            if slots[i].mark {
                continue;
            }
            let stream = match slots[i].stream.take() {
                Some(stream) => stream,
                None => match connect_upstream(endpoint) {
                    Ok(stream) => stream,
                    Err(_) => return None,
                },
            };
            slots[i].mark = true;
            return Some((i, stream));
        }
        None
    }

    /// Return a slot at session close. `stream` is `None` when the socket
    /// was lost and could not be replaced; the next `assign` reconnects.
    ///
    /// A cleared mark means a failover switch reclaimed the slot while the
    /// session was in flight; the socket is dropped (closed) instead of
    /// being put back.
    pub fn release(&self, role: Role, slot: usize, stream: Option<TcpStream>) {
        let mut pools = self.inner.lock().unwrap();
        let slots = match role {
            Role::Active => &mut pools.active,
            Role::Backup => &mut pools.backup,
        };
        if let Some(entry) = slots.get_mut(slot) {
            if entry.mark {
                entry.stream = stream;
                entry.mark = false;
            }
        }
    }

    /// Failover switch: clear every reservation in both arrays. Called
    /// with the failover write lock held, so no assignment races it.
    pub fn switch(&self) {
        let mut pools = self.inner.lock().unwrap();
        for slot in pools.active.iter_mut() {
            slot.mark = false;
        }
        for slot in pools.backup.iter_mut() {
            slot.mark = false;
        }
    }

    #[cfg(test)]
    pub fn marked_count(&self, role: Role) -> usize {
        let pools = self.inner.lock().unwrap();
        let slots = match role {
            Role::Active => &pools.active,
            Role::Backup => &pools.backup,
        };
        slots.iter().filter(|s| s.mark).count()
    }
}

/// Non-blocking upstream connect.
///
/// The connect is issued on a non-blocking socket, so an in-progress
/// result (`EINPROGRESS`/`EALREADY`) is success here; the session finds
/// out whether it completed at its first upstream-writable event.
pub fn connect_upstream(addr: SocketAddr) -> Result<TcpStream, ProxyError> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(ProxyError::InvalidFd)?;
    socket.set_nonblocking(true).map_err(ProxyError::InvalidFd)?;
    socket.set_nodelay(true).map_err(ProxyError::InvalidFd)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) => match e.raw_os_error() {
            Some(libc::EINPROGRESS) | Some(libc::EALREADY) => {}
            _ => return Err(ProxyError::ConnectionFailed(e)),
        },
    }

    Ok(TcpStream::from_std(socket.into()))
}
