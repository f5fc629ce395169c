//! Stats and control surface.
//!
//! A small line-oriented service on its own TCP port or Unix socket,
//! handled by the support loop. One command per connection:
//!
//! - `stats`    -> `STAT <name> <value>` lines and `END`
//! - `graceful` -> `OK`, and the graceful shutdown phase advances
//! - anything else -> `ERROR`
//!
//! Exchanges are tiny and bounded by a short deadline, so the handling
//! here is a simple retry loop on the non-blocking socket rather than a
//! full state machine.

use crate::protocol::Response;
use crate::proxy::{ProxyEnv, ProxyListener};
use crate::proxy::session::ClientStream;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const EXCHANGE_DEADLINE: Duration = Duration::from_millis(200);

/// Drain and serve every pending stats connection.
pub fn handle_stat_events(env: &ProxyEnv, listener: &ProxyListener) {
    loop {
        match listener.accept() {
            Ok(mut conn) => serve(env, &mut conn),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!(error = %e, "Stats accept failed");
                break;
            }
        }
    }
}

fn serve(env: &ProxyEnv, conn: &mut ClientStream) {
    let line = match read_command(conn) {
        Some(line) => line,
        None => return,
    };

    let response: Vec<u8> = match line.as_str() {
        "stats" => render_stats(env),
        "graceful" => {
            info!("Graceful shutdown requested via control surface");
            env.enable_graceful();
            Response::ok().to_vec()
        }
        _ => Response::error().to_vec(),
    };

    write_response(conn, &response);
}

fn render_stats(env: &ProxyEnv) -> Vec<u8> {
    let (current, high_water) = env.conn_counter();
    let failover = env.failover_state();

    let mut out = Vec::new();
    out.extend_from_slice(&Response::stat("current_conn", &current.to_string()));
    out.extend_from_slice(&Response::stat("current_conn_max", &high_water.to_string()));
    out.extend_from_slice(&Response::stat("conn_max", &env.conn_max.to_string()));
    out.extend_from_slice(&Response::stat("worker_max", &env.worker_max.to_string()));
    out.extend_from_slice(&Response::stat(
        "connpool_max",
        &env.connpool.capacity().to_string(),
    ));
    out.extend_from_slice(&Response::stat(
        "client_pool_max",
        &env.client_slots.capacity().to_string(),
    ));
    out.extend_from_slice(&Response::stat("role", failover.role.name()));
    out.extend_from_slice(&Response::stat(
        "graceful_phase",
        env.graceful_phase().name(),
    ));
    out.extend_from_slice(Response::end());
    out
}

/// Read one CRLF-terminated command, bounded by the exchange deadline.
fn read_command(conn: &mut ClientStream) -> Option<String> {
    let deadline = Instant::now() + EXCHANGE_DEADLINE;
    let mut buf = [0u8; 256];
    let mut len = 0;

    loop {
        match conn.read(&mut buf[len..]) {
            Ok(0) => break,
            Ok(n) => {
                len += n;
                if buf[..len].ends_with(b"\r\n") || buf[..len].ends_with(b"\n") || len == buf.len() {
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(_) => return None,
        }
    }

    let line = String::from_utf8_lossy(&buf[..len]);
    Some(line.trim_end().to_string())
}

fn write_response(conn: &mut ClientStream, response: &[u8]) {
    let deadline = Instant::now() + EXCHANGE_DEADLINE;
    let mut written = 0;

    while written < response.len() {
        match conn.write(&response[written..]) {
            Ok(0) => return,
            Ok(n) => written += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_env() -> ProxyEnv {
        let mut config = Config::default();
        config.worker_max = 2;
        config.conn_max = 10;
        ProxyEnv::new(&config, "127.0.0.1:11211".parse().unwrap(), None)
    }

    #[test]
    fn test_stats_rendering() {
        let env = test_env();
        env.incr_conn();

        let out = render_stats(&env);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("STAT current_conn 1\r\n"));
        assert!(text.contains("STAT conn_max 10\r\n"));
        assert!(text.contains("STAT role active\r\n"));
        assert!(text.contains("STAT graceful_phase normal\r\n"));
        assert!(text.ends_with("END\r\n"));
    }
}
