//! Pre-allocated client slot pool.
//!
//! Accepting a connection normally costs two buffer allocations. The slot
//! pool pre-allocates `client_pool_max` request/response buffer pairs and
//! hands them out to new sessions; a session that gets one returns it at
//! close (keeping any growth), and a session that finds the pool exhausted
//! falls back to fresh heap buffers.

use crate::proxy::buffer::SessionBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

struct ClientSlot {
    in_use: bool,
    bufs: Option<(SessionBuf, SessionBuf)>,
}

pub struct ClientSlotPool {
    slots: Vec<Mutex<ClientSlot>>,
    cursor: AtomicUsize,
}

impl ClientSlotPool {
    pub fn new(capacity: usize, request_bufsize: usize, response_bufsize: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(ClientSlot {
                    in_use: false,
                    bufs: Some((
                        SessionBuf::new(request_bufsize),
                        SessionBuf::new(response_bufsize),
                    )),
                })
            })
            .collect();
        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot, taking its buffer pair. Scans from a rotating
    /// start so no slot is starved. `None` when the pool is fully used.
    pub fn claim(&self) -> Option<(usize, SessionBuf, SessionBuf)> {
        if self.slots.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        for offset in 0..self.slots.len() {
            let i = (start + offset) % self.slots.len();
            let mut slot = self.slots[i].lock().unwrap();
            if slot.in_use {
                continue;
            }
            if let Some((req, resp)) = slot.bufs.take() {
                slot.in_use = true;
                return Some((i, req, resp));
            }
        }
        None
    }

    /// Return a claimed slot's buffers. Offsets are cleared; capacity
    /// growth is kept for the next session.
    pub fn put_back(&self, index: usize, mut req: SessionBuf, mut resp: SessionBuf) {
        req.reset();
        resp.reset();
        let mut slot = self.slots[index].lock().unwrap();
        slot.bufs = Some((req, resp));
        slot.in_use = false;
    }

    #[cfg(test)]
    fn in_use_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.lock().unwrap().in_use)
            .count()
    }
}
