//! Health checker and failover controller.
//!
//! Runs on the support thread. Each tick issues a probe transaction
//! (`set`, `get`, `delete` of a scratch key) against the active endpoint,
//! `try_max` times. The probe is healthy when at least one command
//! succeeds and unhealthy only when every one fails, so a single dropped
//! packet never triggers a switch.
//!
//! The probe socket blocks, which is fine here: this thread owns no
//! sessions, and every probe I/O carries a short timeout.

use crate::protocol::Response;
use crate::proxy::env::{ProxyEnv, Role};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const PROBE_KEY_BASE: &str = "relay_a_cache_test_key";
const PROBE_VAL_BASE: &str = "relay_a_cache_test_val";
const PROBE_IO_TIMEOUT: Duration = Duration::from_millis(500);

/// Delay before the first tick, then the steady cadence.
pub const INITIAL_DELAY: Duration = Duration::from_secs(3);
pub const INTERVAL: Duration = Duration::from_secs(5);

pub struct HealthChecker {
    /// Persistent probe socket to the active endpoint; reconnected after
    /// a switch to backup and whenever it breaks.
    probe: Option<TcpStream>,
    try_max: u32,
    key: String,
    value: String,
}

impl HealthChecker {
    pub fn new(try_max: u32) -> Self {
        // Suffix the scratch key so proxies sharing an upstream never
        // collide on it.
        let suffix = std::process::id();
        Self {
            probe: None,
            try_max: try_max.max(1),
            key: format!("{PROBE_KEY_BASE}_{suffix}"),
            value: format!("{PROBE_VAL_BASE}_{suffix}"),
        }
    }

    /// One timer tick: probe the active endpoint and switch roles per the
    /// decision matrix (backup + recovered -> active, active + dead ->
    /// backup).
    pub fn tick(&mut self, env: &ProxyEnv) {
        if env.backup_addr.is_none() {
            return;
        }
        let role = env.failover_state().role;

        let healthy = match self.probe.as_mut() {
            Some(stream) => probe_transaction(stream, self.try_max, &self.key, &self.value),
            None => match connect_probe(env) {
                Some(mut stream) => {
                    let healthy = probe_transaction(&mut stream, self.try_max, &self.key, &self.value);
                    self.probe = Some(stream);
                    healthy
                }
                None if role == Role::Backup => {
                    // Still down; keep waiting for the active side to recover
                    debug!("Health probe connect failed, rescheduling");
                    return;
                }
                None => false, // serving active and cannot even connect
            },
        };

        match (role, healthy) {
            (Role::Backup, true) => {
                env.switch_role();
                warn!("Active endpoint recovered, switching back to it");
            }
            (Role::Active, false) => {
                env.switch_role();
                warn!("Active endpoint unhealthy, switching to backup");
            }
            _ => {}
        }

        if !healthy {
            // A broken socket is useless for the next tick
            self.probe = None;
        }
    }
}

fn connect_probe(env: &ProxyEnv) -> Option<TcpStream> {
    let stream = TcpStream::connect_timeout(&env.target_addr, PROBE_IO_TIMEOUT).ok()?;
    stream.set_read_timeout(Some(PROBE_IO_TIMEOUT)).ok()?;
    stream.set_write_timeout(Some(PROBE_IO_TIMEOUT)).ok()?;
    Some(stream)
}

/// Run the set/get/delete transaction `try_max` times. Healthy when at
/// least one of the `3 * try_max` commands succeeds.
fn probe_transaction(stream: &mut TcpStream, try_max: u32, key: &str, value: &str) -> bool {
    let set_cmd = format!("set {} 0 0 {}\r\n{}\r\n", key, value.len(), value);
    let get_cmd = format!("get {key}\r\n");
    let delete_cmd = format!("delete {key}\r\n");

    let mut get_expected = Response::value(key, 0, value.as_bytes()).to_vec();
    get_expected.extend_from_slice(Response::end());

    let mut failures = 0u32;
    for round in 0..try_max {
        if !run_command(stream, set_cmd.as_bytes(), Response::stored()) {
            failures += 1;
        }
        if !run_command(stream, get_cmd.as_bytes(), &get_expected) {
            failures += 1;
        }
        if !run_command(stream, delete_cmd.as_bytes(), Response::deleted()) {
            failures += 1;
        }
        if round + 1 < try_max {
            std::thread::sleep(probe_pause());
        }
    }

    failures < try_max * 3
}

fn run_command(stream: &mut TcpStream, command: &[u8], expected: &[u8]) -> bool {
    if stream.write_all(command).is_err() {
        return false;
    }

    let mut response = vec![0u8; expected.len()];
    let mut total = 0;
    while total < expected.len() {
        match stream.read(&mut response[total..]) {
            Ok(0) => return false,
            Ok(n) => total += n,
            Err(_) => return false,
        }
    }
    response == expected
}

/// 200-290 ms, jittered off the clock's subsecond nanos so concurrent
/// probes against one upstream spread out.
fn probe_pause() -> Duration {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(200 + 10 * (nanos as u64 % 10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::net::TcpListener;
    use std::thread;

    /// A stub upstream that answers the probe transaction correctly
    /// `rounds` times, then hangs up.
    fn stub_upstream(rounds: u32) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 512];
            for _ in 0..rounds * 3 {
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let request = &buf[..n];
                let reply: Vec<u8> = if request.starts_with(b"set ") {
                    Response::stored().to_vec()
                } else if request.starts_with(b"get ") {
                    let key = std::str::from_utf8(&request[4..n - 2]).unwrap();
                    let suffix = key.rsplit('_').next().unwrap();
                    let value = format!("{PROBE_VAL_BASE}_{suffix}");
                    let mut reply = Response::value(key, 0, value.as_bytes()).to_vec();
                    reply.extend_from_slice(Response::end());
                    reply
                } else {
                    Response::deleted().to_vec()
                };
                if stream.write_all(&reply).is_err() {
                    return;
                }
            }
        });
        addr
    }

    #[test]
    fn test_probe_healthy_against_stub() {
        let addr = stub_upstream(1);
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(PROBE_IO_TIMEOUT)).unwrap();

        let suffix = std::process::id();
        let key = format!("{PROBE_KEY_BASE}_{suffix}");
        let value = format!("{PROBE_VAL_BASE}_{suffix}");
        assert!(probe_transaction(&mut stream, 1, &key, &value));
    }

    #[test]
    fn test_probe_unhealthy_when_refused() {
        // Bind then drop to get an address nothing listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut stream = match TcpStream::connect_timeout(&addr, Duration::from_millis(100)) {
            Ok(stream) => stream,
            Err(_) => return, // refused at connect: equally unhealthy
        };
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        assert!(!probe_transaction(&mut stream, 1, "k", "v"));
    }

    #[test]
    fn test_unhealthy_active_switches_to_backup() {
        // Active endpoint: nothing listening
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let backup = stub_upstream(1);

        let mut config = Config::default();
        config.worker_max = 1;
        config.health_check_try_max = 1;
        let env = ProxyEnv::new(&config, dead, Some(backup));

        let mut checker = HealthChecker::new(1);
        checker.tick(&env);
        assert_eq!(env.failover_state().role, Role::Backup);
    }

    #[test]
    fn test_recovered_active_switches_back() {
        let alive = stub_upstream(2);

        let mut config = Config::default();
        config.worker_max = 1;
        config.health_check_try_max = 1;
        let env = ProxyEnv::new(&config, alive, Some(alive));
        env.switch_role(); // simulate an earlier failover to backup
        assert_eq!(env.failover_state().role, Role::Backup);

        let mut checker = HealthChecker::new(1);
        checker.tick(&env);
        assert_eq!(env.failover_state().role, Role::Active);
    }

    #[test]
    fn test_no_backup_means_no_checks() {
        let mut config = Config::default();
        config.worker_max = 1;
        let env = ProxyEnv::new(&config, "127.0.0.1:1".parse().unwrap(), None);

        let mut checker = HealthChecker::new(3);
        checker.tick(&env); // must not block or switch
        assert_eq!(env.failover_state().role, Role::Active);
    }
}
