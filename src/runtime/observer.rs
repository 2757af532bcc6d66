//! Injectable sink for event loop activity.
//!
//! Loops never print. They report to an `Observer`; the default one
//! forwards to `tracing`.

use crate::runtime::connection::CloseReason;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Something observable happened on a loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    Listening { conn_id: usize, addr: SocketAddr },
    Accepted { conn_id: usize, peer: SocketAddr },
    Connected { conn_id: usize, peer: SocketAddr },
    /// A complete inbound frame (payload only).
    Received { conn_id: usize, message: Bytes },
    /// An outbound frame was fully written.
    Sent { conn_id: usize, bytes: usize },
    Closed { conn_id: usize, reason: CloseReason },
    /// The loop left `run`.
    Stopped,
}

pub trait Observer: Send + Sync {
    fn observe(&self, event: &LoopEvent);
}

/// Logs every event with `tracing`, tagged with the loop's role.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    role: String,
}

impl TracingObserver {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }
}

impl Observer for TracingObserver {
    fn observe(&self, event: &LoopEvent) {
        let role = self.role.as_str();
        match event {
            LoopEvent::Listening { conn_id, addr } => {
                info!(role, conn_id, addr = %addr, "Listening")
            }
            LoopEvent::Accepted { conn_id, peer } => {
                info!(role, conn_id, peer = %peer, "Accepted connection")
            }
            LoopEvent::Connected { conn_id, peer } => {
                info!(role, conn_id, peer = %peer, "Connected")
            }
            LoopEvent::Received { conn_id, message } => {
                info!(role, conn_id, message = %String::from_utf8_lossy(message), "Received")
            }
            LoopEvent::Sent { conn_id, bytes } => trace!(role, conn_id, bytes, "Sent"),
            LoopEvent::Closed {
                conn_id,
                reason: CloseReason::Error { kind, message },
            } => warn!(role, conn_id, kind = ?kind, error = %message, "Channel failed"),
            LoopEvent::Closed { conn_id, reason } => {
                debug!(role, conn_id, reason = ?reason, "Channel closed")
            }
            LoopEvent::Stopped => info!(role, "Event loop stopped"),
        }
    }
}

/// Keeps every event in memory. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LoopEvent>>,
    changed: Condvar,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events so far.
    pub fn events(&self) -> Vec<LoopEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Block until `done` holds for the recorded events or `timeout` passes.
    /// Returns whether `done` held.
    pub fn wait_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&[LoopEvent]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let Ok(mut events) = self.events.lock() else {
            return false;
        };
        loop {
            if done(&events) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = match self.changed.wait_timeout(events, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            };
        }
    }
}

impl Observer for RecordingObserver {
    fn observe(&self, event: &LoopEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        self.changed.notify_all();
    }
}
