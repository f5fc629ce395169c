//! Per-connection session state machine.
//!
//! A session bridges one client socket and one upstream socket through a
//! request buffer and a response buffer, cycling through four states:
//!
//! ```text
//! ClientRead -> UpstreamWrite -> UpstreamRead -> ClientWrite -+
//!     ^                                                       |
//!     +-------------------------------------------------------+
//! ```
//!
//! Exactly one of the two sockets is armed for readiness at any time,
//! chosen by the current state. Every callback re-checks the failover
//! flags and the per-session loop bound before touching a socket, which is
//! how in-flight sessions die deterministically across a role switch.

use crate::error::ProxyError;
use crate::protocol::{self, Command};
use crate::proxy::buffer::SessionBuf;
use crate::proxy::connpool::connect_upstream;
use crate::proxy::env::{ProxyEnv, Role};
use crate::proxy::slowlog::PhaseTimes;
use mio::event::Source;
use mio::net::{TcpStream, UnixStream};
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::time::Instant;
use tracing::debug;

/// Front-side socket: the listener may be TCP or Unix-domain.
#[derive(Debug)]
pub enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(stream) => stream.read(buf),
            ClientStream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(stream) => stream.write(buf),
            ClientStream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ClientStream::Tcp(stream) => stream.flush(),
            ClientStream::Unix(stream) => stream.flush(),
        }
    }
}

impl Source for ClientStream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            ClientStream::Tcp(stream) => stream.register(registry, token, interests),
            ClientStream::Unix(stream) => stream.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            ClientStream::Tcp(stream) => stream.reregister(registry, token, interests),
            ClientStream::Unix(stream) => stream.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            ClientStream::Tcp(stream) => stream.deregister(registry),
            ClientStream::Unix(stream) => stream.deregister(registry),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    ClientRead,
    UpstreamWrite,
    UpstreamRead,
    ClientWrite,
}

/// Which socket the event loop should watch for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmTarget {
    Client,
    Upstream,
}

/// Outcome of one readiness callback.
#[derive(Debug)]
pub enum SessionFate {
    /// Nothing decided yet; keep the current watcher armed.
    Continue,
    /// Clean end of the session.
    CloseOk,
    /// The session failed; close and report.
    CloseErr(ProxyError),
}

/// Lazily sampled begin/end stamps for the three latency phases.
#[derive(Debug, Default)]
struct PhaseStamps {
    to_upstream_begin: Option<Instant>,
    to_upstream_end: Option<Instant>,
    from_upstream_begin: Option<Instant>,
    from_upstream_end: Option<Instant>,
    to_client_begin: Option<Instant>,
    to_client_end: Option<Instant>,
}

pub struct Session {
    client: ClientStream,
    upstream: Option<TcpStream>,
    pool_slot: Option<usize>,
    client_slot: Option<usize>,

    req_buf: SessionBuf,
    resp_buf: SessionBuf,
    req_written: usize,
    resp_written: usize,

    request_count: usize,
    response_count: usize,
    command: Command,

    loop_count: u64,
    observed_role: Role,
    state: SessionState,
    stamps: PhaseStamps,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: ClientStream,
        upstream: TcpStream,
        pool_slot: Option<usize>,
        client_slot: Option<usize>,
        req_buf: SessionBuf,
        resp_buf: SessionBuf,
        observed_role: Role,
    ) -> Self {
        Self {
            client,
            upstream: Some(upstream),
            pool_slot,
            client_slot,
            req_buf,
            resp_buf,
            req_written: 0,
            resp_written: 0,
            request_count: 0,
            response_count: 0,
            command: Command::NotDetected,
            loop_count: 0,
            observed_role,
            state: SessionState::ClientRead,
            stamps: PhaseStamps::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_mut(&mut self) -> &mut ClientStream {
        &mut self.client
    }

    pub fn upstream_mut(&mut self) -> Option<&mut TcpStream> {
        self.upstream.as_mut()
    }

    /// The socket and interest the loop should arm for the current state.
    pub fn armed(&self) -> (ArmTarget, Interest) {
        match self.state {
            SessionState::ClientRead => (ArmTarget::Client, Interest::READABLE),
            SessionState::UpstreamWrite => (ArmTarget::Upstream, Interest::WRITABLE),
            SessionState::UpstreamRead => (ArmTarget::Upstream, Interest::READABLE),
            SessionState::ClientWrite => (ArmTarget::Client, Interest::WRITABLE),
        }
    }

    /// Role/quiescing and loop-bound checks shared by every callback.
    fn check_guards(&mut self, env: &ProxyEnv) -> Option<ProxyError> {
        let failover = env.failover_state();
        if self.observed_role != failover.role || failover.quiescing {
            return Some(ProxyError::InvalidPool);
        }
        if env.loop_max > 0 {
            self.loop_count += 1;
            if self.loop_count > env.loop_max {
                return Some(ProxyError::OutOfLoop);
            }
        }
        None
    }

    /// Readiness on the client socket.
    pub fn on_client_event(&mut self, env: &ProxyEnv, readable: bool, writable: bool) -> SessionFate {
        if let Some(err) = self.check_guards(env) {
            return SessionFate::CloseErr(err);
        }

        if readable && self.state == SessionState::ClientRead {
            return self.client_read();
        }
        if writable && self.state == SessionState::ClientWrite {
            return self.client_write(env);
        }
        SessionFate::Continue
    }

    /// Readiness on the upstream socket.
    pub fn on_upstream_event(
        &mut self,
        env: &ProxyEnv,
        readable: bool,
        writable: bool,
    ) -> SessionFate {
        if let Some(err) = self.check_guards(env) {
            return SessionFate::CloseErr(err);
        }

        if readable && self.state == SessionState::UpstreamRead {
            return self.upstream_read();
        }
        if writable && self.state == SessionState::UpstreamWrite {
            return self.upstream_write(env);
        }
        SessionFate::Continue
    }

    fn client_read(&mut self) -> SessionFate {
        self.req_buf.grow_if_full();
        let n = match self.client.read(self.req_buf.spare()) {
            Ok(0) => return SessionFate::CloseOk, // client hung up
            Ok(n) => n,
            Err(ref e) if recoverable(e) => return SessionFate::Continue,
            Err(e) => return SessionFate::CloseErr(ProxyError::FailedRead(e)),
        };
        self.req_buf.advance(n);

        self.command = protocol::detect_command(self.req_buf.filled());
        if self.command == Command::Quit {
            return SessionFate::CloseOk;
        }
        if matches!(self.command, Command::Get | Command::Set) {
            self.request_count = protocol::count_request_items(self.command, self.req_buf.filled());
        }

        if self.req_buf.len() < 2 {
            return SessionFate::Continue;
        }
        if protocol::ends_with_crlf(self.req_buf.filled()) {
            if self.command == Command::Unknown {
                debug!("Closing session on unrecognized command");
                return SessionFate::CloseOk;
            }
            // A set is complete only once its payload line has arrived
            if self.command == Command::Set && self.request_count < 2 {
                return SessionFate::Continue;
            }
            self.state = SessionState::UpstreamWrite;
        }
        SessionFate::Continue
    }

    fn upstream_write(&mut self, env: &ProxyEnv) -> SessionFate {
        if self.stamps.to_upstream_begin.is_none() {
            self.stamps.to_upstream_begin = Some(Instant::now());
        }

        let upstream = match self.upstream.as_mut() {
            Some(upstream) => upstream,
            None => return SessionFate::CloseErr(ProxyError::BrokenPipe),
        };

        let pending = &self.req_buf.filled()[self.req_written..];
        match upstream.write(pending) {
            Ok(n) => {
                self.req_written += n;
                if self.req_written >= self.req_buf.len() {
                    self.state = SessionState::UpstreamRead;
                    self.stamps.to_upstream_end = Some(Instant::now());
                }
                SessionFate::Continue
            }
            Err(ref e) if recoverable(e) => SessionFate::Continue,
            Err(e) => {
                let broken_pipe = e.kind() == io::ErrorKind::BrokenPipe;
                if self.pool_slot.is_some() {
                    self.replace_pooled_upstream(env);
                }
                if broken_pipe {
                    SessionFate::CloseErr(ProxyError::BrokenPipe)
                } else {
                    SessionFate::CloseErr(ProxyError::FailedWrite(e))
                }
            }
        }
    }

    /// On a pooled upstream write failure the slot's socket is replaced by
    /// a fresh connection to the current endpoint, and the session still
    /// fails. The replacement goes back to the pool at close, ready for
    /// the next session.
    fn replace_pooled_upstream(&mut self, env: &ProxyEnv) {
        self.upstream = None; // drop the broken socket
        match connect_upstream(env.current_endpoint()) {
            Ok(stream) => self.upstream = Some(stream),
            Err(e) => debug!(error = %e, "Failed to replace pooled upstream socket"),
        }
    }

    fn upstream_read(&mut self) -> SessionFate {
        if self.stamps.from_upstream_begin.is_none() {
            self.stamps.from_upstream_begin = Some(Instant::now());
        }

        self.resp_buf.grow_if_full();
        let upstream = match self.upstream.as_mut() {
            Some(upstream) => upstream,
            None => return SessionFate::CloseErr(ProxyError::BrokenPipe),
        };
        let n = match upstream.read(self.resp_buf.spare()) {
            Ok(0) => {
                return SessionFate::CloseErr(ProxyError::FailedRead(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream closed mid-response",
                )))
            }
            Ok(n) => n,
            Err(ref e) if recoverable(e) => return SessionFate::Continue,
            Err(e) => return SessionFate::CloseErr(ProxyError::FailedRead(e)),
        };
        self.resp_buf.advance(n);

        let complete = if self.command == Command::Get {
            self.response_count = protocol::count_value_lines(self.resp_buf.filled());
            self.response_count >= self.request_count
        } else {
            self.resp_buf.len() > 2 && protocol::ends_with_crlf(self.resp_buf.filled())
        };

        if complete {
            self.state = SessionState::ClientWrite;
            self.stamps.from_upstream_end = Some(Instant::now());
        }
        SessionFate::Continue
    }

    fn client_write(&mut self, env: &ProxyEnv) -> SessionFate {
        if self.stamps.to_client_begin.is_none() {
            self.stamps.to_client_begin = Some(Instant::now());
        }

        let pending = &self.resp_buf.filled()[self.resp_written..];
        match self.client.write(pending) {
            Ok(n) => {
                self.resp_written += n;
                if self.resp_written < self.resp_buf.len() {
                    return SessionFate::Continue;
                }

                self.stamps.to_client_end = Some(Instant::now());
                if let Some(times) = self.phase_times() {
                    env.slowlog.observe(self.command_name(), &times);
                }

                // Round trip done: reset for the next request
                self.req_buf.reset();
                self.resp_buf.reset();
                self.req_written = 0;
                self.resp_written = 0;
                self.request_count = 0;
                self.response_count = 0;
                self.command = Command::NotDetected;
                self.stamps = PhaseStamps::default();
                self.state = SessionState::ClientRead;
                SessionFate::Continue
            }
            Err(ref e) if recoverable(e) => SessionFate::Continue,
            Err(ref e) if e.kind() == io::ErrorKind::BrokenPipe => {
                SessionFate::CloseErr(ProxyError::BrokenPipe)
            }
            Err(e) => SessionFate::CloseErr(ProxyError::FailedWrite(e)),
        }
    }

    fn phase_times(&self) -> Option<PhaseTimes> {
        let to_upstream_begin = self.stamps.to_upstream_begin?;
        let to_upstream_end = self.stamps.to_upstream_end?;
        let from_upstream_begin = self.stamps.from_upstream_begin?;
        let from_upstream_end = self.stamps.from_upstream_end?;
        let to_client_begin = self.stamps.to_client_begin?;
        let to_client_end = self.stamps.to_client_end?;

        Some(PhaseTimes {
            to_upstream: to_upstream_end.duration_since(to_upstream_begin),
            from_upstream: from_upstream_end.duration_since(from_upstream_begin),
            to_client: to_client_end.duration_since(to_client_begin),
            total: to_client_end.duration_since(to_upstream_begin),
        })
    }

    fn command_name(&self) -> &'static str {
        match self.command {
            Command::Get => "get",
            Command::Set => "set",
            Command::Delete => "delete",
            Command::Quit => "quit",
            Command::Unknown => "unknown",
            Command::NotDetected => "none",
        }
    }

    /// Termination routine. Consumes the session: closes the client
    /// socket, hands the upstream socket and any claimed buffers back to
    /// their pools, and decrements the connection count.
    pub fn finish(self, env: &ProxyEnv) {
        let Session {
            client,
            upstream,
            pool_slot,
            client_slot,
            req_buf,
            resp_buf,
            observed_role,
            ..
        } = self;

        drop(client);

        match pool_slot {
            Some(slot) => env.connpool.release(observed_role, slot, upstream),
            None => drop(upstream), // ephemeral: just close it
        }

        if let Some(index) = client_slot {
            env.client_slots.put_back(index, req_buf, resp_buf);
        }

        env.decr_conn();
    }
}

fn recoverable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
