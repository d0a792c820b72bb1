//! The consumed radio data-service interface.
//!
//! The bearer never talks to the modem directly; it hands requests to a
//! [`DataService`] implementation, which executes them asynchronously and
//! posts the reply back as a bearer event through the [`ReplyEnvelope`].
//! Unsolicited notifications (registration changes, roaming, NR state,
//! link capacity, keepalive status) flow through the [`EventSender`]
//! registered per bearer.

use std::net::IpAddr;
use std::time::Duration;

use talus_common::apn::{ApnProfile, PdpProtocol};
use talus_common::radio::RadioTech;

use crate::event::{BearerEvent, BearerId, EventSender};
use crate::keepalive::KeepalivePacket;
use crate::link::{LinkAddress, LinkProperties};

/// Reason carried on a setup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupReason {
    Normal,
    Handover,
}

/// Reason carried on a deactivate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivateReason {
    Normal,
    Shutdown,
    Handover,
}

/// Driver-level rejection of a request, before the modem saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFault {
    RadioNotAvailable,
}

/// The modem's reply to a call setup.
///
/// `cause` 0 means the call is up; any other value is a modem-specific
/// failure code, optionally accompanied by a suggested retry delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCallResponse {
    pub cause: i32,
    /// Raw retry suggestion; see `RetryHint::decode`.
    pub suggested_retry_ms: i32,
    /// Modem context id, unique across transports.
    pub cid: i32,
    pub interface_name: String,
    pub addresses: Vec<LinkAddress>,
    pub dns: Vec<IpAddr>,
    pub pcscf: Vec<IpAddr>,
    pub gateways: Vec<IpAddr>,
    /// 0 means the modem did not report an MTU.
    pub mtu: u32,
    pub protocol: PdpProtocol,
}

impl Default for DataCallResponse {
    fn default() -> Self {
        DataCallResponse {
            cause: 0,
            suggested_retry_ms: -1,
            cid: -1,
            interface_name: String::new(),
            addresses: Vec::new(),
            dns: Vec::new(),
            pcscf: Vec::new(),
            gateways: Vec::new(),
            mtu: 0,
            protocol: PdpProtocol::Ipv4v6,
        }
    }
}

/// A call-setup request as handed to the driver.
#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub rat: RadioTech,
    pub profile: ApnProfile,
    pub modem_roaming: bool,
    pub allow_roaming: bool,
    pub reason: SetupReason,
    /// Present on handover setups: the live link to move.
    pub handover_link_properties: Option<LinkProperties>,
}

/// Reply path for one outstanding driver request.
///
/// Carries the tag the request was issued with; the bearer drops any reply
/// whose tag no longer matches its own.
#[derive(Debug, Clone)]
pub struct ReplyEnvelope {
    events: EventSender,
    bearer: BearerId,
    tag: u32,
}

impl ReplyEnvelope {
    pub fn new(events: EventSender, bearer: BearerId, tag: u32) -> Self {
        ReplyEnvelope { events, bearer, tag }
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn setup_done(self, reply: Result<DataCallResponse, DriverFault>) {
        self.events
            .post(self.bearer, BearerEvent::SetupDataCallDone { tag: self.tag, reply });
    }

    pub fn deactivate_done(self) {
        self.events
            .post(self.bearer, BearerEvent::DeactivateDone { tag: self.tag });
    }
}

/// The lower data-service driver contract.
///
/// All calls are non-blocking; long-running work replies through the
/// envelope or the registered event sender.
pub trait DataService: Send {
    fn setup_data_call(&mut self, request: SetupRequest, reply: ReplyEnvelope);

    /// `reply` is `None` for fire-and-forget deactivation.
    fn deactivate_data_call(
        &mut self,
        cid: i32,
        reason: DeactivateReason,
        reply: Option<ReplyEnvelope>,
    );

    /// Start a NATT keepalive on `cid`; the driver replies with a
    /// `KeepaliveStarted` event echoing `slot`.
    fn start_natt_keepalive(
        &mut self,
        cid: i32,
        slot: u32,
        packet: KeepalivePacket,
        interval: Duration,
    );

    /// Stop the keepalive session `handle`; the driver replies with a
    /// `KeepaliveStopped` event.
    fn stop_natt_keepalive(&mut self, handle: u32);

    /// Subscribe the bearer to registration/roaming/NR/frequency
    /// notifications. Called when the bearer attaches to the machine.
    fn register_state_listener(&mut self, bearer: BearerId, events: EventSender);
    fn unregister_state_listener(&mut self, bearer: BearerId);

    /// Subscribe the bearer to voice-call and link-capacity callbacks.
    /// Called on Active entry, dropped on Active exit.
    fn register_call_listener(&mut self, bearer: BearerId);
    fn unregister_call_listener(&mut self, bearer: BearerId);
}
