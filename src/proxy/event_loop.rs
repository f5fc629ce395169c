//! mio-based session loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! session performs one non-blocking syscall per callback. Uses epoll on
//! Linux, kqueue on macOS.
//!
//! Each worker owns one `SessionLoop`; the accept loop owns another that
//! additionally hosts the listener (and any overflow sessions it drives
//! itself). A session keeps exactly one watcher armed at a time, picked by
//! its state; every callback ends by re-arming, which also re-delivers
//! readiness that was left unconsumed.

use crate::proxy::env::ProxyEnv;
use crate::proxy::session::{ArmTarget, Session, SessionFate};
use mio::{event::Source, Events, Poll, Token};
use slab::Slab;
use std::io;
use std::time::Duration;
use tracing::debug;

/// Token reserved for the accept loop's listener.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

struct Entry {
    session: Session,
    /// Which of the two sockets currently holds the armed watcher.
    registered: ArmTarget,
}

pub struct SessionLoop {
    poll: Poll,
    events: Events,
    sessions: Slab<Entry>,
}

impl SessionLoop {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity.max(8)),
            sessions: Slab::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Register an external source (the accept loop's listener) under
    /// `LISTENER_TOKEN`.
    pub fn register_listener<S: Source>(&self, source: &mut S) -> io::Result<()> {
        self.poll
            .registry()
            .register(source, LISTENER_TOKEN, mio::Interest::READABLE)
    }

    pub fn deregister_listener<S: Source>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Refresh the listener's watcher. Registrations are edge-triggered,
    /// so after an admission gate left connections in the backlog this
    /// re-delivers the pending readiness.
    pub fn rearm_listener<S: Source>(&self, source: &mut S) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(source, LISTENER_TOKEN, mio::Interest::READABLE)
    }

    /// Take ownership of a session and arm its initial watcher. A session
    /// that cannot be registered is terminated on the spot.
    pub fn attach(&mut self, session: Session, env: &ProxyEnv) {
        let entry = Entry {
            registered: session.armed().0,
            session,
        };
        let idx = self.sessions.insert(entry);
        if let Err(e) = self.register_current(idx) {
            debug!(error = %e, "Failed to register session watchers");
            let entry = self.sessions.remove(idx);
            entry.session.finish(env);
        }
    }

    /// Run until every attached session has terminated.
    pub fn run_until_drained(&mut self, env: &ProxyEnv) -> io::Result<()> {
        while !self.sessions.is_empty() {
            self.poll_once(env, None)?;
        }
        Ok(())
    }

    /// One poll + dispatch pass. Returns whether the listener token fired.
    pub fn poll_once(&mut self, env: &ProxyEnv, timeout: Option<Duration>) -> io::Result<bool> {
        let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
        let result = self.poll_into(&mut events, env, timeout);
        self.events = events;
        result
    }

    fn poll_into(
        &mut self,
        events: &mut Events,
        env: &ProxyEnv,
        timeout: Option<Duration>,
    ) -> io::Result<bool> {
        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e),
        }

        let mut listener_ready = false;
        for event in events.iter() {
            let token = event.token();
            if token == LISTENER_TOKEN {
                listener_ready = true;
                continue;
            }
            // Peer-closed and error conditions surface through the same
            // paths as plain readiness: the next read sees EOF, the next
            // write sees the errno.
            let readable = event.is_readable() || event.is_read_closed();
            let writable = event.is_writable() || event.is_write_closed();
            self.dispatch(env, token, readable, writable);
        }
        Ok(listener_ready)
    }

    fn dispatch(&mut self, env: &ProxyEnv, token: Token, readable: bool, writable: bool) {
        let idx = token.0 / 2;
        let is_client = token.0 % 2 == 0;

        let entry = match self.sessions.get_mut(idx) {
            Some(entry) => entry,
            None => return, // already closed within this batch
        };

        let fate = if is_client {
            entry.session.on_client_event(env, readable, writable)
        } else {
            entry.session.on_upstream_event(env, readable, writable)
        };

        match fate {
            SessionFate::Continue => {
                if let Err(e) = self.rearm(idx) {
                    debug!(error = %e, "Failed to re-arm session watcher");
                    self.close(env, idx);
                }
            }
            SessionFate::CloseOk => {
                debug!("Session closed");
                self.close(env, idx);
            }
            SessionFate::CloseErr(err) => {
                if err.is_expected_on_switch() {
                    debug!(error = %err, "Session invalidated by failover switch");
                } else {
                    debug!(error = %err, "Session error");
                }
                self.close(env, idx);
            }
        }
    }

    /// Register the socket the session's state wants watched.
    fn register_current(&mut self, idx: usize) -> io::Result<()> {
        let registry = self.poll.registry();
        let entry = &mut self.sessions[idx];
        let (target, interest) = entry.session.armed();
        match target {
            ArmTarget::Client => {
                registry.register(entry.session.client_mut(), Token(idx * 2), interest)
            }
            ArmTarget::Upstream => {
                let upstream = entry
                    .session
                    .upstream_mut()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "upstream gone"))?;
                registry.register(upstream, Token(idx * 2 + 1), interest)
            }
        }?;
        entry.registered = target;
        Ok(())
    }

    /// Move or refresh the armed watcher after a callback.
    ///
    /// Re-registering the same socket is not redundant: it re-delivers
    /// readiness the callback did not fully consume.
    fn rearm(&mut self, idx: usize) -> io::Result<()> {
        let registry = self.poll.registry();
        let entry = &mut self.sessions[idx];
        let (target, interest) = entry.session.armed();

        if target == entry.registered {
            return match target {
                ArmTarget::Client => {
                    registry.reregister(entry.session.client_mut(), Token(idx * 2), interest)
                }
                ArmTarget::Upstream => {
                    let upstream = entry
                        .session
                        .upstream_mut()
                        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "upstream gone"))?;
                    registry.reregister(upstream, Token(idx * 2 + 1), interest)
                }
            };
        }

        // The state moved to the other socket: swap watchers
        match entry.registered {
            ArmTarget::Client => registry.deregister(entry.session.client_mut())?,
            ArmTarget::Upstream => {
                if let Some(upstream) = entry.session.upstream_mut() {
                    registry.deregister(upstream)?;
                }
            }
        }
        self.register_current(idx)
    }

    fn close(&mut self, env: &ProxyEnv, idx: usize) {
        if !self.sessions.contains(idx) {
            return;
        }
        let mut entry = self.sessions.remove(idx);
        let registry = self.poll.registry();
        match entry.registered {
            ArmTarget::Client => {
                let _ = registry.deregister(entry.session.client_mut());
            }
            ArmTarget::Upstream => {
                if let Some(upstream) = entry.session.upstream_mut() {
                    let _ = registry.deregister(upstream);
                }
            }
        }
        entry.session.finish(env);
    }
}
