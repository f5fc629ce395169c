//! The proxy engine.
//!
//! Thread layout: one accept thread (this module's `run` runs it on the
//! caller's thread), `worker_max` worker threads each owning an event
//! loop, and one support thread hosting the health-check timer and the
//! stats surface. All of them share one `ProxyEnv`.

mod accept;
mod buffer;
mod client_slots;
mod connpool;
mod env;
mod event_loop;
mod health;
mod queue;
pub mod session;
mod slowlog;
mod worker;

pub use accept::ProxyListener;
pub use env::{FailoverState, GracefulPhase, ProxyEnv, Role};

use crate::config::{Config, EventModel};
use crate::error::ProxyError;
use crate::stats;
use health::HealthChecker;
use mio::{Events, Interest, Poll, Token};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

const STAT_TOKEN: Token = Token(0);
const STAT_BACKLOG: i32 = 16;

pub struct Proxy {
    env: Arc<ProxyEnv>,
    front: ProxyListener,
    stat: ProxyListener,
    try_max: u32,
}

impl Proxy {
    pub fn new(config: Config) -> Result<Self, ProxyError> {
        if config.event_model != EventModel::Auto {
            info!(
                requested = config.event_model.name(),
                "Event backend is chosen by the platform (epoll/kqueue)"
            );
        }

        let target_addr = resolve(&config.target_server)?;
        let backup_addr = if config.backup_server.is_empty() {
            None
        } else {
            Some(resolve(&config.backup_server)?)
        };

        let front = accept::bind_front(&config)?;
        let stat = ProxyListener::bind(
            &config.stat_sockpath,
            config.stat_port,
            config.access_mask,
            STAT_BACKLOG,
        )?;

        let env = Arc::new(ProxyEnv::new(&config, target_addr, backup_addr));

        Ok(Self {
            env,
            front,
            stat,
            try_max: config.health_check_try_max,
        })
    }

    /// Shared environment handle, for embedding and for signaling graceful
    /// shutdown from outside.
    pub fn env(&self) -> Arc<ProxyEnv> {
        Arc::clone(&self.env)
    }

    pub fn front_addr(&self) -> Option<SocketAddr> {
        self.front.local_addr()
    }

    pub fn stat_addr(&self) -> Option<SocketAddr> {
        self.stat.local_addr()
    }

    /// Run until graceful shutdown completes. The accept loop occupies the
    /// calling thread; workers and the support loop get their own.
    pub fn run(self) -> Result<(), ProxyError> {
        let workers = worker::spawn(&self.env).map_err(ProxyError::InvalidFd)?;

        let support = {
            let env = Arc::clone(&self.env);
            let stat = self.stat;
            let try_max = self.try_max;
            thread::Builder::new()
                .name("support".to_string())
                .spawn(move || support_loop(&env, stat, try_max))
                .map_err(ProxyError::InvalidFd)?
        };

        info!(
            target = %self.env.target_addr,
            backup = ?self.env.backup_addr,
            workers = self.env.worker_max,
            "Proxy accepting connections"
        );
        accept::run(&self.env, self.front).map_err(ProxyError::InvalidFd)?;

        for handle in workers {
            let _ = handle.join();
        }
        let _ = support.join();
        info!("Proxy stopped");
        Ok(())
    }
}

/// Support loop: stats surface plus the health-check timer. The poll
/// timeout doubles as the timer tick, with the first check delayed and a
/// steady cadence afterwards.
fn support_loop(env: &Arc<ProxyEnv>, mut stat: ProxyListener, try_max: u32) {
    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(e) => {
            error!(error = %e, "Support loop failed to start");
            return;
        }
    };
    if let Err(e) = poll
        .registry()
        .register(&mut stat, STAT_TOKEN, Interest::READABLE)
    {
        error!(error = %e, "Failed to register stats listener");
        return;
    }

    let mut events = Events::with_capacity(16);
    let mut checker = HealthChecker::new(try_max);
    let mut next_check = Instant::now() + health::INITIAL_DELAY;

    loop {
        if env.graceful_phase() == GracefulPhase::Completed {
            break;
        }

        let until_check = next_check.saturating_duration_since(Instant::now());
        let timeout = until_check.min(Duration::from_millis(500));
        match poll.poll(&mut events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Support loop poll failed");
                break;
            }
        }

        if events.iter().next().is_some() {
            stats::handle_stat_events(env, &stat);
        }

        if Instant::now() >= next_check {
            checker.tick(env);
            next_check = Instant::now() + health::INTERVAL;
        }
    }
}

fn resolve(server: &str) -> Result<SocketAddr, ProxyError> {
    server
        .to_socket_addrs()
        .map_err(|e| ProxyError::Config(format!("cannot resolve '{server}': {e}")))?
        .next()
        .ok_or_else(|| ProxyError::Config(format!("'{server}' resolves to no address")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    /// Minimal memcached-flavoured upstream: enough of the text protocol
    /// to answer what the tests send through the proxy.
    fn stub_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for conn in listener.incoming() {
                let mut conn = match conn {
                    Ok(conn) => conn,
                    Err(_) => continue,
                };
                thread::spawn(move || {
                    let mut pending = Vec::new();
                    let mut buf = [0u8; 1024];
                    loop {
                        let n = match conn.read(&mut buf) {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        pending.extend_from_slice(&buf[..n]);
                        while let Some(reply) = answer(&mut pending) {
                            if conn.write_all(&reply).is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// Consume one complete request from `pending`, producing its reply.
    fn answer(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
        let line_end = pending.windows(2).position(|w| w == b"\r\n")?;
        let line = String::from_utf8_lossy(&pending[..line_end]).to_string();
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");

        match command {
            "get" => {
                pending.drain(..line_end + 2);
                let mut reply = Vec::new();
                for key in parts {
                    reply.extend_from_slice(
                        format!("VALUE {key} 0 3\r\nbar\r\n").as_bytes(),
                    );
                }
                reply.extend_from_slice(b"END\r\n");
                Some(reply)
            }
            "set" => {
                let bytes: usize = parts.nth(3)?.parse().ok()?;
                let total = line_end + 2 + bytes + 2;
                if pending.len() < total {
                    return None;
                }
                pending.drain(..total);
                Some(b"STORED\r\n".to_vec())
            }
            "delete" => {
                pending.drain(..line_end + 2);
                Some(b"DELETED\r\n".to_vec())
            }
            _ => {
                pending.drain(..line_end + 2);
                Some(b"ERROR\r\n".to_vec())
            }
        }
    }

    fn test_config(upstream: SocketAddr) -> Config {
        let mut config = Config::default();
        config.port = 0; // ephemeral
        config.stat_port = 0;
        config.target_server = upstream.to_string();
        config.worker_max = 2;
        config.conn_max = 8;
        config.connpool_max = 2;
        config.client_pool_max = 2;
        config
    }

    fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    /// Listeners bind 0.0.0.0; connect via loopback explicitly.
    fn loopback(addr: SocketAddr) -> SocketAddr {
        SocketAddr::new([127, 0, 0, 1].into(), addr.port())
    }

    #[test]
    fn test_proxy_end_to_end() {
        let upstream = stub_upstream();
        let proxy = Proxy::new(test_config(upstream)).unwrap();
        let front = loopback(proxy.front_addr().unwrap());
        let stat = loopback(proxy.stat_addr().unwrap());
        let env = proxy.env();

        let runner = thread::spawn(move || proxy.run().unwrap());

        // Single get
        let mut client = TcpStream::connect(front).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"get foo\r\n").unwrap();
        assert_eq!(
            read_exactly(&mut client, 25),
            b"VALUE foo 0 3\r\nbar\r\nEND\r\n"
        );

        // Set with payload on the same connection
        client.write_all(b"set baz 0 0 3\r\nqux\r\n").unwrap();
        assert_eq!(read_exactly(&mut client, 8), b"STORED\r\n");

        // Multi-get framing
        client.write_all(b"get a b c\r\n").unwrap();
        let expected = b"VALUE a 0 3\r\nbar\r\nVALUE b 0 3\r\nbar\r\nVALUE c 0 3\r\nbar\r\nEND\r\n";
        assert_eq!(read_exactly(&mut client, expected.len()), expected);

        // Quit closes the connection
        client.write_all(b"quit\r\n").unwrap();
        let mut end = [0u8; 1];
        assert_eq!(client.read(&mut end).unwrap(), 0);
        drop(client);

        // Stats surface
        let mut stat_conn = TcpStream::connect(stat).unwrap();
        stat_conn
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stat_conn.write_all(b"stats\r\n").unwrap();
        let mut text = String::new();
        let mut buf = [0u8; 1024];
        while !text.ends_with("END\r\n") {
            let n = stat_conn.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            text.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert!(text.contains("STAT current_conn_max 1\r\n"));
        assert!(text.contains("STAT role active\r\n"));
        drop(stat_conn);

        // Graceful shutdown through the control surface
        let mut ctl = TcpStream::connect(stat).unwrap();
        ctl.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        ctl.write_all(b"graceful\r\n").unwrap();
        assert_eq!(read_exactly(&mut ctl, 4), b"OK\r\n");
        drop(ctl);

        let deadline = Instant::now() + Duration::from_secs(10);
        while env.graceful_phase() != GracefulPhase::Completed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(env.graceful_phase(), GracefulPhase::Completed);
        runner.join().unwrap();
    }

    #[test]
    fn test_sessions_reuse_pooled_upstreams() {
        let upstream = stub_upstream();
        let mut config = test_config(upstream);
        config.connpool_max = 1;
        let proxy = Proxy::new(config).unwrap();
        let front = loopback(proxy.front_addr().unwrap());
        let env = proxy.env();

        let runner = thread::spawn(move || proxy.run().unwrap());

        // Serial clients share the single pooled upstream socket
        for _ in 0..3 {
            let mut client = TcpStream::connect(front).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            client.write_all(b"get foo\r\n").unwrap();
            assert_eq!(
                read_exactly(&mut client, 25),
                b"VALUE foo 0 3\r\nbar\r\nEND\r\n"
            );
            client.write_all(b"quit\r\n").unwrap();
            let mut end = [0u8; 1];
            assert_eq!(client.read(&mut end).unwrap(), 0);
            drop(client);

            // Wait for the close path to release the pool slot
            let deadline = Instant::now() + Duration::from_secs(5);
            while env.conn_counter().0 > 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            assert_eq!(env.conn_counter().0, 0);
        }
        assert_eq!(env.conn_counter().1, 1);

        env.enable_graceful();
        let deadline = Instant::now() + Duration::from_secs(10);
        while env.graceful_phase() != GracefulPhase::Completed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        runner.join().unwrap();
    }
}
