//! The bearer event taxonomy.
//!
//! Everything that reaches a bearer — bring-up requests, driver replies,
//! registration changes, policy overrides, keepalive traffic — arrives as a
//! [`BearerEvent`] posted through an [`EventSender`]. Driver replies carry
//! the tag they were issued with; replies whose tag no longer matches the
//! bearer are dropped as stale.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::warn;

use talus_common::apn::{ApnProfile, ApnTypes};
use talus_common::fail::{FailCause, RetryHint};
use talus_common::radio::{DataRegState, NrFrequency, NrState, RadioTech};

use crate::caps::SubOverrides;
use crate::driver::{DataCallResponse, DriverFault};
use crate::keepalive::{KeepalivePacket, KeepaliveStatus};

// ─── Addressing ─────────────────────────────────────────────────────────────

/// Identity of one bearer within a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BearerId(pub u32);

impl fmt::Display for BearerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dc{}", self.0)
    }
}

/// An event addressed to a specific bearer.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub bearer: BearerId,
    pub event: BearerEvent,
}

/// Cloneable handle for posting events into the dispatcher queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<Envelope>,
}

impl EventSender {
    pub(crate) fn new(tx: Sender<Envelope>) -> Self {
        EventSender { tx }
    }

    pub fn post(&self, bearer: BearerId, event: BearerEvent) {
        if self.tx.send(Envelope { bearer, event }).is_err() {
            warn!(%bearer, "event dropped: dispatcher gone");
        }
    }
}

// ─── Consumer attachment ────────────────────────────────────────────────────

/// How a bring-up request was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Normal,
    /// Bring-up that replaces a live session on the opposite transport.
    Handover,
}

/// How a teardown releases the bearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseType {
    Normal,
    Detach,
    Handover,
}

/// One logical APN consumer, as seen by this bearer.
///
/// The outer tracker owns the real context; the bearer keeps a value copy
/// with just what it needs to serve the attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApnContext {
    /// Tracker-assigned handle, unique per consumer.
    pub id: u32,
    /// The single APN type this consumer requests.
    pub apn_type: ApnTypes,
    /// The APN profile the consumer resolved to.
    pub profile: ApnProfile,
    /// Network-specifier constraint on the consumer's request, if any.
    pub specifier: Option<String>,
    /// The consumer's request does not carry `NOT_RESTRICTED`.
    pub restricted: bool,
    /// The consumer may only use the bearer while it is unmetered.
    pub unmetered_only: bool,
}

/// Parameters of one consumer attachment, carried by `Connect`.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub ctx: ApnContext,
    /// Modem data-profile id used in the setup request.
    pub profile_id: u32,
    /// Radio technology at request time.
    pub rat: RadioTech,
    /// Completion callback; resolved exactly once per attachment attempt.
    pub on_completed: Sender<ConnectionCompleted>,
    /// Request generation, echoed back so the tracker can drop stale
    /// completions on its side.
    pub generation: u32,
    pub request_type: RequestType,
    pub sub_id: i32,
    /// This APN is the subscription's preferred one.
    pub preferred: bool,
    /// Stamped by the bearer at init-connection time.
    pub(crate) tag: u32,
}

/// Completion of a bring-up (or broadcast notification of a bearer-level
/// outcome) delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCompleted {
    pub ctx_id: u32,
    pub cause: FailCause,
    /// Modem-suggested retry delay, when the failure carried one. The
    /// outer tracker decides when (and whether) to retry.
    pub retry_hint: Option<RetryHint>,
    pub generation: u32,
    pub request_type: RequestType,
}

/// Parameters of a teardown request.
#[derive(Debug, Clone)]
pub struct DisconnectParams {
    /// The consumer detaching; `None` releases all consumers.
    pub ctx_id: Option<u32>,
    pub reason: String,
    pub release: ReleaseType,
    pub on_completed: Option<Sender<DisconnectCompleted>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectCompleted {
    pub ctx_id: Option<u32>,
    pub reason: String,
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Everything a bearer can be asked to process.
#[derive(Debug, Clone)]
pub enum BearerEvent {
    /// Attach a consumer, bringing the bearer up if needed.
    Connect(ConnectionParams),
    /// Detach one consumer (tear down if it is the last).
    Disconnect(DisconnectParams),
    /// Unconditional teardown of all consumers.
    DisconnectAll(DisconnectParams),
    /// Re-attempt the last saved connect attempt.
    RetryConnection,
    /// Force the bearer to Inactive from any state.
    Reset,
    /// Fire-and-forget deactivation, no reply expected.
    TearDownNow,
    /// The network dropped an active bearer.
    LostConnection,

    /// Driver reply to `setup_data_call`.
    SetupDataCallDone {
        tag: u32,
        reply: Result<DataCallResponse, DriverFault>,
    },
    /// Driver reply to `deactivate_data_call`.
    DeactivateDone { tag: u32 },

    /// Registration or serving-RAT change.
    DataRegChanged(DataRegState),
    NrStateChanged(NrState),
    NrFrequencyChanged(NrFrequency),
    RoamOn,
    RoamOff,
    /// Policy manager flipped the unmetered override.
    UnmeteredOverrideChanged(bool),
    /// Subscription plan override bits changed.
    SubscriptionOverrideChanged {
        mask: SubOverrides,
        value: SubOverrides,
    },
    /// Re-check whether the restricted override can be lifted.
    ReevaluateRestricted,
    /// Re-check score and push it if changed.
    ReevaluateProperties,

    /// Modem bandwidth estimate (solicited refresh).
    BwRefreshDone { down_kbps: u32, up_kbps: u32 },
    /// Modem bandwidth estimate (unsolicited).
    LinkCapacityChanged { down_kbps: u32, up_kbps: u32 },
    VoiceCallStarted,
    VoiceCallEnded,

    KeepaliveStartRequest {
        slot: u32,
        packet: KeepalivePacket,
        interval: Duration,
    },
    KeepaliveStopRequest { slot: u32 },
    /// Driver reply to a keepalive start.
    KeepaliveStarted {
        slot: u32,
        handle: u32,
        status: KeepaliveStatus,
    },
    /// Unsolicited keepalive status from the modem.
    KeepaliveStatusChanged {
        handle: u32,
        status: KeepaliveStatus,
    },
    /// Driver reply to a keepalive stop.
    KeepaliveStopped { handle: u32 },
}

impl BearerEvent {
    /// Stable name for logs and defer bookkeeping.
    pub fn name(&self) -> &'static str {
        match self {
            BearerEvent::Connect(_) => "connect",
            BearerEvent::Disconnect(_) => "disconnect",
            BearerEvent::DisconnectAll(_) => "disconnect_all",
            BearerEvent::RetryConnection => "retry_connection",
            BearerEvent::Reset => "reset",
            BearerEvent::TearDownNow => "tear_down_now",
            BearerEvent::LostConnection => "lost_connection",
            BearerEvent::SetupDataCallDone { .. } => "setup_data_call_done",
            BearerEvent::DeactivateDone { .. } => "deactivate_done",
            BearerEvent::DataRegChanged(_) => "data_reg_changed",
            BearerEvent::NrStateChanged(_) => "nr_state_changed",
            BearerEvent::NrFrequencyChanged(_) => "nr_frequency_changed",
            BearerEvent::RoamOn => "roam_on",
            BearerEvent::RoamOff => "roam_off",
            BearerEvent::UnmeteredOverrideChanged(_) => "unmetered_override_changed",
            BearerEvent::SubscriptionOverrideChanged { .. } => "subscription_override_changed",
            BearerEvent::ReevaluateRestricted => "reevaluate_restricted",
            BearerEvent::ReevaluateProperties => "reevaluate_properties",
            BearerEvent::BwRefreshDone { .. } => "bw_refresh_done",
            BearerEvent::LinkCapacityChanged { .. } => "link_capacity_changed",
            BearerEvent::VoiceCallStarted => "voice_call_started",
            BearerEvent::VoiceCallEnded => "voice_call_ended",
            BearerEvent::KeepaliveStartRequest { .. } => "keepalive_start_request",
            BearerEvent::KeepaliveStopRequest { .. } => "keepalive_stop_request",
            BearerEvent::KeepaliveStarted { .. } => "keepalive_started",
            BearerEvent::KeepaliveStatusChanged { .. } => "keepalive_status_changed",
            BearerEvent::KeepaliveStopped { .. } => "keepalive_stopped",
        }
    }
}
