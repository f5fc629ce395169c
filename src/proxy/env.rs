//! Shared proxy environment.
//!
//! One `ProxyEnv` is built at startup and shared (via `Arc`) by the accept
//! loop, every worker, and the support loop. It owns the pools, the
//! hand-off queue, and the failover/graceful state machines.

use crate::config::Config;
use crate::proxy::client_slots::ClientSlotPool;
use crate::proxy::connpool::ConnPool;
use crate::proxy::queue::EventQueue;
use crate::proxy::session::Session;
use crate::proxy::slowlog::SlowLog;
use std::net::SocketAddr;
use std::sync::{Mutex, RwLock};

/// Which upstream endpoint is currently serving traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Backup,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Active => "active",
            Role::Backup => "backup",
        }
    }
}

/// Failover flags, mutated together under one write lock so readers never
/// observe a torn pair.
#[derive(Debug, Clone, Copy)]
pub struct FailoverState {
    pub role: Role,
    /// Set for the duration of a switch: blocks new admissions and fails
    /// in-flight sessions on their next readiness callback.
    pub quiescing: bool,
}

/// Graceful shutdown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GracefulPhase {
    Normal,
    Enabled,
    StopAccept,
    Completed,
}

impl GracefulPhase {
    pub fn name(&self) -> &'static str {
        match self {
            GracefulPhase::Normal => "normal",
            GracefulPhase::Enabled => "enabled",
            GracefulPhase::StopAccept => "stop_accept",
            GracefulPhase::Completed => "completed",
        }
    }
}

/// Live connection counter with its high-water mark.
#[derive(Debug, Default)]
pub struct ConnCounter {
    pub current: usize,
    pub high_water: usize,
}

/// Per-instance shared state.
pub struct ProxyEnv {
    // capacity knobs
    pub worker_max: usize,
    pub conn_max: usize,
    pub loop_max: u64,
    pub request_bufsize: usize,
    pub response_bufsize: usize,

    // endpoints
    pub target_addr: SocketAddr,
    pub backup_addr: Option<SocketAddr>,

    // live state
    conn_counter: Mutex<ConnCounter>,
    failover: RwLock<FailoverState>,
    graceful: Mutex<GracefulPhase>,
    busy: Vec<RwLock<bool>>,

    // owned subsystems
    pub connpool: ConnPool,
    pub client_slots: ClientSlotPool,
    pub queue: EventQueue<Session>,
    pub slowlog: SlowLog,
}

impl ProxyEnv {
    pub fn new(config: &Config, target_addr: SocketAddr, backup_addr: Option<SocketAddr>) -> Self {
        let busy = (0..config.worker_max).map(|_| RwLock::new(false)).collect();

        Self {
            worker_max: config.worker_max,
            conn_max: config.conn_max,
            loop_max: config.loop_max,
            request_bufsize: config.request_bufsize,
            response_bufsize: config.response_bufsize,
            target_addr,
            backup_addr,
            conn_counter: Mutex::new(ConnCounter::default()),
            failover: RwLock::new(FailoverState {
                role: Role::Active,
                quiescing: false,
            }),
            graceful: Mutex::new(GracefulPhase::Normal),
            busy,
            connpool: ConnPool::new(config.connpool_max),
            client_slots: ClientSlotPool::new(
                config.client_pool_max,
                config.request_bufsize,
                config.response_bufsize,
            ),
            queue: EventQueue::new(config.conn_max),
            slowlog: SlowLog::from_config(config),
        }
    }

    /// Snapshot of the failover flags (hot path: one read lock).
    pub fn failover_state(&self) -> FailoverState {
        *self.failover.read().unwrap()
    }

    /// The endpoint new upstream connections should go to.
    pub fn current_endpoint(&self) -> SocketAddr {
        self.endpoint_for(self.failover_state().role)
    }

    pub fn endpoint_for(&self, role: Role) -> SocketAddr {
        match role {
            Role::Active => self.target_addr,
            Role::Backup => self.backup_addr.unwrap_or(self.target_addr),
        }
    }

    /// Failover switch: quiesce, flip role, reset pool reservations, zero
    /// the connection count. In-flight sessions observe the role change on
    /// their next readiness callback and terminate themselves.
    pub fn switch_role(&self) {
        let mut failover = self.failover.write().unwrap();
        failover.quiescing = true;
        failover.role = match failover.role {
            Role::Active => Role::Backup,
            Role::Backup => Role::Active,
        };
        self.connpool.switch();
        {
            let mut counter = self.conn_counter.lock().unwrap();
            counter.current = 0;
        }
        failover.quiescing = false;
    }

    pub fn incr_conn(&self) -> usize {
        let mut counter = self.conn_counter.lock().unwrap();
        counter.current += 1;
        if counter.current > counter.high_water {
            counter.high_water = counter.current;
        }
        counter.current
    }

    /// Decrement on session close. Guarded at zero: a failover switch
    /// resets the counter while sessions are still draining, so their
    /// closes must not underflow it. The last close after the listener
    /// stops advances the graceful phase.
    pub fn decr_conn(&self) {
        let mut counter = self.conn_counter.lock().unwrap();
        if counter.current > 0 {
            counter.current -= 1;
            if counter.current == 0 {
                let mut phase = self.graceful.lock().unwrap();
                if *phase == GracefulPhase::StopAccept {
                    *phase = GracefulPhase::Completed;
                }
            }
        }
    }

    pub fn conn_counter(&self) -> (usize, usize) {
        let counter = self.conn_counter.lock().unwrap();
        (counter.current, counter.high_water)
    }

    pub fn graceful_phase(&self) -> GracefulPhase {
        *self.graceful.lock().unwrap()
    }

    /// External graceful-shutdown signal: Normal -> Enabled.
    pub fn enable_graceful(&self) {
        let mut phase = self.graceful.lock().unwrap();
        if *phase == GracefulPhase::Normal {
            *phase = GracefulPhase::Enabled;
        }
    }

    /// Enabled -> StopAccept, taken by the accept loop once it has
    /// disarmed the listener.
    pub fn stop_accepting(&self) {
        let mut phase = self.graceful.lock().unwrap();
        if *phase == GracefulPhase::Enabled {
            *phase = GracefulPhase::StopAccept;
            // No connections left to drain: complete immediately.
            let counter = self.conn_counter.lock().unwrap();
            if counter.current == 0 {
                *phase = GracefulPhase::Completed;
            }
        }
    }

    #[cfg(test)]
    pub fn set_quiescing(&self, value: bool) {
        self.failover.write().unwrap().quiescing = value;
    }

    pub fn set_worker_busy(&self, tid: usize, value: bool) {
        if let Some(flag) = self.busy.get(tid) {
            *flag.write().unwrap() = value;
        }
    }

    /// Accept-loop heuristic: hand off through the queue unless every
    /// worker is already inside a draining loop.
    pub fn all_workers_busy(&self) -> bool {
        self.busy
            .iter()
            .all(|flag| *flag.read().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_env() -> ProxyEnv {
        let mut config = Config::default();
        config.worker_max = 2;
        config.conn_max = 4;
        ProxyEnv::new(
            &config,
            "127.0.0.1:11211".parse().unwrap(),
            Some("127.0.0.1:11212".parse().unwrap()),
        )
    }

    #[test]
    fn test_conn_counter_high_water() {
        let env = test_env();
        assert_eq!(env.incr_conn(), 1);
        assert_eq!(env.incr_conn(), 2);
        env.decr_conn();
        assert_eq!(env.conn_counter(), (1, 2));
    }

    #[test]
    fn test_decr_guard_at_zero() {
        let env = test_env();
        env.incr_conn();
        env.switch_role(); // resets the counter to zero
        env.decr_conn(); // the draining session must not underflow
        assert_eq!(env.conn_counter().0, 0);
    }

    #[test]
    fn test_switch_flips_role_and_endpoint() {
        let env = test_env();
        assert_eq!(env.failover_state().role, Role::Active);
        assert_eq!(env.current_endpoint(), env.target_addr);

        env.switch_role();
        let state = env.failover_state();
        assert_eq!(state.role, Role::Backup);
        assert!(!state.quiescing);
        assert_eq!(env.current_endpoint(), env.backup_addr.unwrap());
    }

    #[test]
    fn test_graceful_phases() {
        let env = test_env();
        assert_eq!(env.graceful_phase(), GracefulPhase::Normal);

        env.incr_conn();
        env.enable_graceful();
        assert_eq!(env.graceful_phase(), GracefulPhase::Enabled);

        env.stop_accepting();
        assert_eq!(env.graceful_phase(), GracefulPhase::StopAccept);

        // Last close completes the shutdown
        env.decr_conn();
        assert_eq!(env.graceful_phase(), GracefulPhase::Completed);
    }

    #[test]
    fn test_graceful_completes_when_idle() {
        let env = test_env();
        env.enable_graceful();
        env.stop_accepting();
        assert_eq!(env.graceful_phase(), GracefulPhase::Completed);
    }

    #[test]
    fn test_worker_busy_heuristic() {
        let env = test_env();
        assert!(!env.all_workers_busy());
        env.set_worker_busy(0, true);
        assert!(!env.all_workers_busy());
        env.set_worker_busy(1, true);
        assert!(env.all_workers_busy());
    }
}
