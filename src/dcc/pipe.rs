//! Per-token pipe state: the two listening endpoints, the sockets that
//! bind to them, and the bookkeeping needed to finalize exactly once.
//!
//! See spec.md §3 "DCC pipe record" and §4.5's state diagram. Held only
//! by the engine's single owning task (`super::engine_loop`); never
//! shared, so no locking is needed here.

use std::time::Instant;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

use super::Token;

pub struct PipeHolder {
    pub token: Token,
    pub created_at: Instant,
    pub receiver_port: Option<u16>,
    pub sender_port: Option<u16>,
    pub receiver_accept_task: Option<JoinHandle<()>>,
    pub sender_accept_task: Option<JoinHandle<()>>,
    pub receiver_halves: Option<(OwnedReadHalf, OwnedWriteHalf)>,
    pub sender_halves: Option<(OwnedReadHalf, OwnedWriteHalf)>,
    pub pumps_remaining: u8,
    pub pump_tasks: Vec<JoinHandle<std::io::Result<()>>>,
    pub finalized: bool,
}

impl PipeHolder {
    pub fn new(token: Token, now: Instant) -> PipeHolder {
        PipeHolder {
            token,
            created_at: now,
            receiver_port: None,
            sender_port: None,
            receiver_accept_task: None,
            sender_accept_task: None,
            receiver_halves: None,
            sender_halves: None,
            pumps_remaining: 0,
            pump_tasks: Vec::new(),
            finalized: false,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.receiver_halves.is_some() && self.sender_halves.is_some()
    }

    /// Aborts every still-running task owned by this pipe. Called once,
    /// from the engine's finalize routine.
    pub fn abort_all(&mut self) {
        if let Some(task) = self.receiver_accept_task.take() {
            task.abort();
        }
        if let Some(task) = self.sender_accept_task.take() {
            task.abort();
        }
        for task in self.pump_tasks.drain(..) {
            task.abort();
        }
    }
}
