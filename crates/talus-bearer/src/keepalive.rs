//! NATT keepalive slot tracking.
//!
//! The upstream connectivity layer addresses keepalive sessions by slot;
//! the modem addresses them by its own session handle. This tracker holds
//! the slot ↔ handle mapping for one bearer while sessions are live.

use std::collections::HashMap;
use std::net::SocketAddr;

/// A NATT keepalive packet template handed down from the upstream layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepalivePacket {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}

/// Status reported back to the upstream layer for a keepalive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveStatus {
    Success,
    /// The bearer cannot run keepalives (wrong transport, not active).
    InvalidNetwork,
    HardwareError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Start requested, no modem handle yet.
    Pending,
    Active,
    Stopping,
}

#[derive(Debug, Clone)]
struct Session {
    state: SessionState,
    handle: Option<u32>,
}

/// Slot-indexed keepalive sessions for one bearer.
#[derive(Debug, Default)]
pub struct KeepaliveTracker {
    sessions: HashMap<u32, Session>,
    by_handle: HashMap<u32, u32>,
}

impl KeepaliveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a start was forwarded to the modem for `slot`.
    pub fn start_requested(&mut self, slot: u32) {
        self.sessions.insert(
            slot,
            Session {
                state: SessionState::Pending,
                handle: None,
            },
        );
    }

    /// Record the modem handle once the start reply arrives.
    pub fn started(&mut self, slot: u32, handle: u32) {
        if let Some(session) = self.sessions.get_mut(&slot) {
            session.state = SessionState::Active;
            session.handle = Some(handle);
            self.by_handle.insert(handle, slot);
        }
    }

    /// Drop a slot whose start failed.
    pub fn start_failed(&mut self, slot: u32) {
        self.sessions.remove(&slot);
    }

    /// Mark a slot stopping and return the modem handle to stop, if known.
    pub fn stop_requested(&mut self, slot: u32) -> Option<u32> {
        let session = self.sessions.get_mut(&slot)?;
        session.state = SessionState::Stopping;
        session.handle
    }

    /// Resolve a stop reply; returns the slot that was stopped.
    pub fn stopped(&mut self, handle: u32) -> Option<u32> {
        let slot = self.by_handle.remove(&handle)?;
        self.sessions.remove(&slot);
        Some(slot)
    }

    pub fn slot_for_handle(&self, handle: u32) -> Option<u32> {
        self.by_handle.get(&handle).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Forget all sessions (bearer leaving Active).
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.by_handle.clear();
    }
}
