//! The exposed upstream network-agent surface.
//!
//! An agent is what the OS connectivity layer sees for one live network:
//! it owns the exposure of link properties, capabilities, and lifecycle
//! notifications. A bearer in Active owns exactly one agent; during a
//! handover window the destination additionally holds a non-owning
//! reference to the source's agent until ownership is transferred with an
//! explicit acquire/release pair.

use std::sync::Arc;

use talus_common::radio::{RadioTech, Transport};

use crate::caps::NetCapabilities;
use crate::event::BearerId;
use crate::keepalive::KeepaliveStatus;
use crate::link::LinkProperties;

/// Detailed connection state reported to the upstream layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailedState {
    Connecting,
    Connected,
    /// Up but unusable: out of service, or voice call on a non-concurrent
    /// RAT.
    Suspended,
    Disconnected,
}

impl DetailedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetailedState::Connecting => "connecting",
            DetailedState::Connected => "connected",
            DetailedState::Suspended => "suspended",
            DetailedState::Disconnected => "disconnected",
        }
    }
}

/// Network status snapshot pushed to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub detailed: DetailedState,
    pub rat: RadioTech,
    pub reason: Option<String>,
    /// The APN being served, for diagnostics on the upstream side.
    pub apn: String,
}

/// One upstream network surface.
///
/// Implementations post to the connectivity layer; all methods are
/// non-blocking.
pub trait NetworkAgent: Send + Sync {
    fn send_link_properties(&self, lp: &LinkProperties);
    fn send_capabilities(&self, caps: &NetCapabilities);
    fn send_network_info(&self, info: &NetworkInfo);
    fn send_score(&self, score: u8);
    fn on_keepalive_event(&self, slot: u32, status: KeepaliveStatus);

    /// Record `owner` as the bearer now speaking for this agent. Ownership
    /// transfers are explicit so handovers stay auditable.
    fn acquire_ownership(&self, owner: BearerId, transport: Transport);
    fn release_ownership(&self, owner: BearerId);
}

/// Shared handle to an agent. The owning bearer keeps it in its record;
/// a handover destination may briefly hold a second, non-owning clone.
pub type AgentHandle = Arc<dyn NetworkAgent>;

/// Creates agents when a bearer reaches Active without one to adopt.
pub trait AgentFactory: Send {
    fn create(
        &mut self,
        bearer: BearerId,
        name: &str,
        info: &NetworkInfo,
        lp: &LinkProperties,
        caps: &NetCapabilities,
        score: u8,
    ) -> AgentHandle;
}
