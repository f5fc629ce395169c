//! Accept loop: admission control and session hand-off.
//!
//! A single listener (TCP or Unix-domain) feeds the whole proxy. Each
//! admission reserves an upstream socket before calling `accept`, so an
//! accepted client always has somewhere to go; failures roll the
//! reservation back. Admitted sessions are queued for a worker, or driven
//! on the accept loop's own `SessionLoop` when every worker is busy.

use crate::config::Config;
use crate::error::ProxyError;
use crate::proxy::buffer::SessionBuf;
use crate::proxy::connpool::connect_upstream;
use crate::proxy::env::{GracefulPhase, ProxyEnv, Role};
use crate::proxy::event_loop::SessionLoop;
use crate::proxy::session::{ClientStream, Session};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UnixListener};
use mio::{Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Front or stats listener: TCP port or Unix-domain socket.
pub enum ProxyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ProxyListener {
    /// Bind per configuration: a non-empty `sockpath` wins over the port.
    pub fn bind(sockpath: &str, port: u16, access_mask: u32, backlog: i32) -> Result<Self, ProxyError> {
        if sockpath.is_empty() {
            Self::bind_tcp(port, backlog)
        } else {
            Self::bind_unix(sockpath, access_mask, backlog)
        }
    }

    pub fn bind_tcp(port: u16, backlog: i32) -> Result<Self, ProxyError> {
        let addr: SocketAddr = format!("0.0.0.0:{port}")
            .parse()
            .map_err(|e| ProxyError::Config(format!("bad listen port: {e}")))?;
        let socket =
            socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
                .map_err(ProxyError::InvalidFd)?;
        socket.set_reuse_address(true).map_err(ProxyError::InvalidFd)?;
        socket.set_nonblocking(true).map_err(ProxyError::InvalidFd)?;
        socket.bind(&addr.into()).map_err(ProxyError::InvalidFd)?;
        socket.listen(backlog).map_err(ProxyError::InvalidFd)?;
        Ok(ProxyListener::Tcp(TcpListener::from_std(socket.into())))
    }

    pub fn bind_unix(path: &str, access_mask: u32, backlog: i32) -> Result<Self, ProxyError> {
        if Path::new(path).exists() {
            std::fs::remove_file(path).map_err(ProxyError::InvalidFd)?;
        }
        let socket = socket2::Socket::new(socket2::Domain::UNIX, socket2::Type::STREAM, None)
            .map_err(ProxyError::InvalidFd)?;
        let addr = socket2::SockAddr::unix(path).map_err(ProxyError::InvalidFd)?;
        socket.bind(&addr).map_err(ProxyError::InvalidFd)?;
        socket.listen(backlog).map_err(ProxyError::InvalidFd)?;
        socket.set_nonblocking(true).map_err(ProxyError::InvalidFd)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(access_mask))
            .map_err(ProxyError::InvalidFd)?;
        Ok(ProxyListener::Unix(UnixListener::from_std(socket.into())))
    }

    pub fn accept(&self) -> io::Result<ClientStream> {
        match self {
            ProxyListener::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                Ok(ClientStream::Tcp(stream))
            }
            ProxyListener::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                Ok(ClientStream::Unix(stream))
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ProxyListener::Tcp(listener) => listener.local_addr().ok(),
            ProxyListener::Unix(_) => None,
        }
    }
}

impl Source for ProxyListener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            ProxyListener::Tcp(listener) => listener.register(registry, token, interests),
            ProxyListener::Unix(listener) => listener.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            ProxyListener::Tcp(listener) => listener.reregister(registry, token, interests),
            ProxyListener::Unix(listener) => listener.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            ProxyListener::Tcp(listener) => listener.deregister(registry),
            ProxyListener::Unix(listener) => listener.deregister(registry),
        }
    }
}

/// Bind the front listener from configuration. Backlog equals `conn_max`.
pub fn bind_front(config: &Config) -> Result<ProxyListener, ProxyError> {
    ProxyListener::bind(
        &config.sockpath,
        config.port,
        config.access_mask,
        config.conn_max as i32,
    )
}

/// Run the accept loop until graceful shutdown completes.
///
/// The loop's `Poll` hosts the listener plus any overflow sessions the
/// accept thread drives itself. A short poll timeout keeps the graceful
/// phase observed even when no traffic arrives.
pub fn run(env: &Arc<ProxyEnv>, mut listener: ProxyListener) -> io::Result<()> {
    let mut session_loop = SessionLoop::new(256)?;
    session_loop.register_listener(&mut listener)?;
    let mut listener_armed = true;

    loop {
        match env.graceful_phase() {
            GracefulPhase::Completed => break,
            GracefulPhase::Enabled => {
                if listener_armed {
                    let _ = session_loop.deregister_listener(&mut listener);
                    listener_armed = false;
                    debug!("Listener disarmed for graceful shutdown");
                }
                env.stop_accepting();
                continue;
            }
            _ => {}
        }

        // Re-arm every pass so clients left in the backlog by an
        // admission gate are picked up once the gate clears.
        if listener_armed {
            session_loop.rearm_listener(&mut listener)?;
        }

        let listener_ready = session_loop.poll_once(env, Some(Duration::from_millis(100)))?;
        if listener_ready && listener_armed {
            accept_batch(env, &listener, &mut session_loop);
        }
    }

    // Drain any overflow sessions still attached here
    while !session_loop.is_empty() {
        session_loop.poll_once(env, Some(Duration::from_millis(100)))?;
    }
    Ok(())
}

/// Accept until the listener would block, admitting each client per the
/// gates: not quiescing, below `conn_max`, upstream reserved.
pub fn accept_batch(env: &Arc<ProxyEnv>, listener: &ProxyListener, session_loop: &mut SessionLoop) {
    loop {
        let failover = env.failover_state();
        if failover.quiescing {
            return;
        }
        if env.conn_counter().0 >= env.conn_max {
            return;
        }

        let role = failover.role;
        let endpoint = env.endpoint_for(role);

        // Reserve the upstream before accepting the client
        let (pool_slot, upstream) = match env.connpool.assign(role, endpoint) {
            Some((slot, stream)) => (Some(slot), stream),
            None => match connect_upstream(endpoint) {
                Ok(stream) => (None, stream),
                Err(e) => {
                    debug!(error = %e, "No upstream available, refusing admission");
                    return;
                }
            },
        };

        let client = match listener.accept() {
            Ok(client) => client,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                rollback(env, role, pool_slot, upstream);
                return;
            }
            Err(e) => {
                rollback(env, role, pool_slot, upstream);
                debug!(error = %e, "Accept failed");
                return;
            }
        };

        let (client_slot, req_buf, resp_buf) = match env.client_slots.claim() {
            Some((index, req, resp)) => (Some(index), req, resp),
            None => (
                None,
                SessionBuf::new(env.request_bufsize),
                SessionBuf::new(env.response_bufsize),
            ),
        };

        let session = Session::new(client, upstream, pool_slot, client_slot, req_buf, resp_buf, role);
        env.incr_conn();

        if !env.all_workers_busy() {
            match env.queue.push(session) {
                Ok(()) => continue,
                Err(session) => {
                    warn!("Event queue full, driving session on the accept loop");
                    session_loop.attach(session, env);
                }
            }
        } else {
            session_loop.attach(session, env);
        }
    }
}

fn rollback(env: &ProxyEnv, role: Role, pool_slot: Option<usize>, upstream: TcpStream) {
    match pool_slot {
        Some(slot) => env.connpool.release(role, slot, Some(upstream)),
        None => drop(upstream),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::net::TcpListener as StdTcpListener;

    fn env_with(conn_max: usize, upstream: SocketAddr) -> Arc<ProxyEnv> {
        let mut config = Config::default();
        config.worker_max = 1;
        config.conn_max = conn_max;
        config.connpool_max = 2;
        config.client_pool_max = 2;
        Arc::new(ProxyEnv::new(&config, upstream, None))
    }

    /// The test listener binds 0.0.0.0; connect via loopback explicitly.
    fn connect_addr(listener: &ProxyListener) -> SocketAddr {
        let addr = listener.local_addr().unwrap();
        SocketAddr::new([127, 0, 0, 1].into(), addr.port())
    }

    fn poll_until_ready(session_loop: &mut SessionLoop, env: &Arc<ProxyEnv>) -> bool {
        for _ in 0..50 {
            if session_loop
                .poll_once(env, Some(Duration::from_millis(20)))
                .unwrap()
            {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_admission_queues_session() {
        let upstream = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let env = env_with(4, upstream.local_addr().unwrap());

        let mut listener = ProxyListener::bind_tcp(0, 16).unwrap();
        let addr = connect_addr(&listener);
        let mut session_loop = SessionLoop::new(16).unwrap();
        session_loop.register_listener(&mut listener).unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();
        assert!(poll_until_ready(&mut session_loop, &env));
        accept_batch(&env, &listener, &mut session_loop);

        assert_eq!(env.conn_counter().0, 1);
        assert_eq!(env.queue.len(), 1);
    }

    #[test]
    fn test_conn_max_gate() {
        let upstream = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let env = env_with(1, upstream.local_addr().unwrap());

        let mut listener = ProxyListener::bind_tcp(0, 16).unwrap();
        let addr = connect_addr(&listener);
        let mut session_loop = SessionLoop::new(16).unwrap();
        session_loop.register_listener(&mut listener).unwrap();

        let _first = std::net::TcpStream::connect(addr).unwrap();
        let _second = std::net::TcpStream::connect(addr).unwrap();
        assert!(poll_until_ready(&mut session_loop, &env));
        accept_batch(&env, &listener, &mut session_loop);

        // Only the first connection is admitted; the second stays in the
        // backlog until a slot frees up.
        assert_eq!(env.conn_counter().0, 1);
        assert_eq!(env.queue.len(), 1);
    }

    #[test]
    fn test_exhausted_pool_falls_back_to_ephemeral() {
        let upstream = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let env = env_with(4, upstream.local_addr().unwrap());
        // Hold one of the two pool slots so only one remains free
        let _held = env
            .connpool
            .assign(Role::Active, upstream.local_addr().unwrap())
            .unwrap();
        assert_eq!(env.connpool.marked_count(Role::Active), 1);

        let mut listener = ProxyListener::bind_tcp(0, 16).unwrap();
        let addr = connect_addr(&listener);
        let mut session_loop = SessionLoop::new(16).unwrap();
        session_loop.register_listener(&mut listener).unwrap();

        let _first = std::net::TcpStream::connect(addr).unwrap();
        let _second = std::net::TcpStream::connect(addr).unwrap();
        assert!(poll_until_ready(&mut session_loop, &env));
        accept_batch(&env, &listener, &mut session_loop);

        // Both clients admitted even though only one pool slot was free;
        // the second session runs on an ephemeral upstream socket.
        assert_eq!(env.conn_counter().0, 2);
        assert_eq!(env.connpool.marked_count(Role::Active), 2);
    }

    #[test]
    fn test_quiescing_blocks_admission() {
        let upstream = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let env = env_with(4, upstream.local_addr().unwrap());

        let mut listener = ProxyListener::bind_tcp(0, 16).unwrap();
        let addr = connect_addr(&listener);
        let mut session_loop = SessionLoop::new(16).unwrap();
        session_loop.register_listener(&mut listener).unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();
        assert!(poll_until_ready(&mut session_loop, &env));

        env.set_quiescing(true);
        accept_batch(&env, &listener, &mut session_loop);
        assert_eq!(env.conn_counter().0, 0);

        // Once the switch finishes, admission resumes
        env.set_quiescing(false);
        accept_batch(&env, &listener, &mut session_loop);
        assert_eq!(env.conn_counter().0, 1);
    }

    #[test]
    fn test_unix_listener_bind() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("relay-a-cache-test-{}.sock", std::process::id()));
        let path_str = path.to_str().unwrap();

        let listener = ProxyListener::bind_unix(path_str, 0o660, 8).unwrap();
        assert!(Path::new(path_str).exists());
        drop(listener);
        let _ = std::fs::remove_file(path_str);
    }
}
