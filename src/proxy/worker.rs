//! Worker threads.
//!
//! Each worker owns its own event loop. It pops one admitted session from
//! the hand-off queue, arms its watchers, marks itself busy, and runs the
//! loop until every session it holds has drained before popping again.
//! The busy flag is the accept loop's signal to bypass the queue and
//! drive overflow sessions itself.

use crate::proxy::env::{GracefulPhase, ProxyEnv};
use crate::proxy::event_loop::SessionLoop;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

const QUEUE_WAIT: Duration = Duration::from_millis(500);

pub fn spawn(env: &Arc<ProxyEnv>) -> std::io::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(env.worker_max);
    for tid in 0..env.worker_max {
        let env = Arc::clone(env);
        let handle = thread::Builder::new()
            .name(format!("worker-{tid}"))
            .spawn(move || {
                if let Err(e) = worker_loop(tid, &env) {
                    error!(worker = tid, error = %e, "Worker failed");
                }
            })?;
        handles.push(handle);
    }
    Ok(handles)
}

fn worker_loop(tid: usize, env: &Arc<ProxyEnv>) -> std::io::Result<()> {
    let mut session_loop = SessionLoop::new(256)?;
    debug!(worker = tid, "Worker started");

    loop {
        if env.graceful_phase() == GracefulPhase::Completed {
            break;
        }

        let session = match env.queue.pop_or_wait(QUEUE_WAIT) {
            Some(session) => session,
            None => continue,
        };

        session_loop.attach(session, env);
        env.set_worker_busy(tid, true);
        if let Err(e) = session_loop.run_until_drained(env) {
            error!(worker = tid, error = %e, "Event loop failed");
        }
        env.set_worker_busy(tid, false);
    }

    debug!(worker = tid, "Worker stopped");
    Ok(())
}
