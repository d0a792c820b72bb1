//! The per-session connection record and its state machine.
//!
//! One `Bearer` is one packet-data session on one transport. Its life is:
//!
//! ```text
//!   Inactive ──Connect──▶ Activating ──setup ok──▶ Active
//!      ▲                      │    │                  │
//!      │            setup rejected │ bad response     │ last consumer gone
//!      │                      │    ▼                  ▼
//!      ├──────────────────────┘  DisconnectingSetupError ──▶ Inactive
//!      └────────────────────────── Disconnecting ◀───────────┘
//! ```
//!
//! All handlers run on the shared dispatcher thread and must not block.
//! Every outbound driver request carries the bearer's current `tag`; the
//! tag is bumped on each entry to Inactive and on each init-connection, so
//! replies to an aborted attempt can never perturb a later one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use quanta::Instant;
use tracing::{debug, info, warn};

use talus_common::apn::{ApnProfile, ApnTypes};
use talus_common::fail::{FailCause, RetryHint};
use talus_common::handover::HandoverState;
use talus_common::radio::{DataRegState, Transport};

use crate::agent::{AgentHandle, DetailedState, NetworkInfo};
use crate::caps::{self, CapsContext, NetCapabilities, Overrides, SCORE_OTHER};
use crate::config::{BandwidthSource, PlatformConfig};
use crate::dispatcher::HostCtx;
use crate::driver::{DeactivateReason, DriverFault, ReplyEnvelope, SetupReason, SetupRequest};
use crate::driver::DataCallResponse;
use crate::event::{
    ApnContext, BearerEvent, BearerId, ConnectionCompleted, ConnectionParams, DisconnectCompleted,
    DisconnectParams, ReleaseType, RequestType,
};
use crate::keepalive::{KeepaliveStatus, KeepaliveTracker};
use crate::link::{self, LinkError, LinkProperties};
use crate::machine::StateId;
use crate::stats::BearerStats;
use crate::tcp_buffers;

/// What Inactive should announce when it is entered.
#[derive(Debug)]
enum InactiveArm {
    ConnectFailed {
        cause: FailCause,
        retry: Option<RetryHint>,
    },
    Disconnected(DisconnectParams),
}

/// The completion callback of the attempt currently in flight. Taken on
/// resolution, so it fires exactly once.
#[derive(Debug)]
struct PendingCompletion {
    sender: crossbeam_channel::Sender<ConnectionCompleted>,
    ctx_id: u32,
    generation: u32,
    request_type: RequestType,
}

/// One packet-data bearer.
pub struct Bearer {
    id: BearerId,
    name: String,
    transport: Transport,
    sub_id: i32,
    config: Arc<PlatformConfig>,

    state: StateId,
    /// Monotonic staleness tag stamped on every outbound request.
    tag: u32,
    /// Modem context id; −1 while inactive.
    cid: i32,
    apn_profile: Option<ApnProfile>,
    consumers: HashMap<u32, ConnectionParams>,
    link_properties: LinkProperties,
    capabilities: NetCapabilities,
    reg: DataRegState,
    overrides: Overrides,
    /// Types whose consumer detached while the bearer stayed up.
    disabled_types: ApnTypes,
    score: u8,
    voice_call_active: bool,
    /// Last modem bandwidth estimate, applied over the table values while
    /// the modem is the configured bandwidth source.
    modem_bandwidth: Option<(u32, u32)>,

    handover_state: HandoverState,
    /// Non-owning reference to the handover source's agent, held only
    /// inside the handover window.
    handover_source_agent: Option<AgentHandle>,
    handover_source: Option<BearerId>,

    network_agent: Option<AgentHandle>,
    keepalives: KeepaliveTracker,

    /// Last connect attempt, kept for the retry path.
    connection_params: Option<ConnectionParams>,
    pending_completion: Option<PendingCompletion>,
    pending_disconnect: Option<DisconnectParams>,
    inactive_arm: Option<InactiveArm>,
    pending_transition: Option<StateId>,
    deferred: Vec<BearerEvent>,

    create_time: Instant,
    last_fail_time: Option<Instant>,
    last_fail_cause: FailCause,
    suggested_retry: Option<RetryHint>,
    stats: BearerStats,
}

impl Bearer {
    pub(crate) fn new(
        id: BearerId,
        name: String,
        transport: Transport,
        sub_id: i32,
        config: Arc<PlatformConfig>,
    ) -> Self {
        Bearer {
            id,
            name,
            transport,
            sub_id,
            config,
            state: StateId::Inactive,
            tag: 0,
            cid: -1,
            apn_profile: None,
            consumers: HashMap::new(),
            link_properties: LinkProperties::default(),
            capabilities: NetCapabilities::default(),
            reg: DataRegState::default(),
            overrides: Overrides::default(),
            disabled_types: ApnTypes::NONE,
            score: SCORE_OTHER,
            voice_call_active: false,
            modem_bandwidth: None,
            handover_state: HandoverState::Idle,
            handover_source_agent: None,
            handover_source: None,
            network_agent: None,
            keepalives: KeepaliveTracker::new(),
            connection_params: None,
            pending_completion: None,
            pending_disconnect: None,
            inactive_arm: None,
            pending_transition: None,
            deferred: Vec::new(),
            create_time: Instant::now(),
            last_fail_time: None,
            last_fail_cause: FailCause::None,
            suggested_retry: None,
            stats: BearerStats::new(),
        }
    }

    /// Attach the bearer to the machine: subscribe to driver notifications
    /// and run the initial Inactive entry.
    pub(crate) fn start(&mut self, host: &mut HostCtx<'_>) {
        host.driver
            .register_state_listener(self.id, host.events.clone());
        debug!(bearer = %self.name, transport = %self.transport, "bearer attached");
        self.enter_state(StateId::Inactive, host);
    }

    /// Detach the bearer: drop subscriptions and clear state.
    pub(crate) fn stop(&mut self, host: &mut HostCtx<'_>) {
        if self.state == StateId::Active {
            self.exit_active(host);
        }
        host.driver.unregister_state_listener(self.id);
        if self.cid >= 0 {
            host.active_cids.remove(&self.cid);
        }
        self.clear_settings();
        debug!(bearer = %self.name, "bearer detached");
    }

    // ─── Observers ──────────────────────────────────────────────────────

    pub fn id(&self) -> BearerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn sub_id(&self) -> i32 {
        self.sub_id
    }

    pub fn state(&self) -> StateId {
        self.state
    }

    pub fn is_inactive(&self) -> bool {
        self.state == StateId::Inactive
    }

    pub fn is_activating(&self) -> bool {
        self.state == StateId::Activating
    }

    pub fn is_active(&self) -> bool {
        self.state == StateId::Active
    }

    pub fn is_disconnecting(&self) -> bool {
        self.state.is_disconnecting()
    }

    pub fn cid(&self) -> i32 {
        self.cid
    }

    /// Current staleness tag. Replies stamped with an older tag are
    /// discarded.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn link_properties(&self) -> &LinkProperties {
        &self.link_properties
    }

    pub fn capabilities(&self) -> &NetCapabilities {
        &self.capabilities
    }

    pub fn apn_profile(&self) -> Option<&ApnProfile> {
        self.apn_profile.as_ref()
    }

    pub fn apn_contexts(&self) -> Vec<ApnContext> {
        self.consumers.values().map(|p| p.ctx.clone()).collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn pcscf_addresses(&self) -> &[std::net::IpAddr] {
        &self.link_properties.pcscf
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    pub fn handover_state(&self) -> HandoverState {
        self.handover_state
    }

    pub fn has_been_transferred(&self) -> bool {
        self.handover_state == HandoverState::Completed
    }

    pub fn is_being_transferred(&self) -> bool {
        self.handover_state == HandoverState::BeingTransferred
    }

    pub fn last_fail_cause(&self) -> FailCause {
        self.last_fail_cause
    }

    pub fn last_fail_time(&self) -> Option<Instant> {
        self.last_fail_time
    }

    pub fn create_time(&self) -> Instant {
        self.create_time
    }

    /// The modem's retry suggestion from the most recent setup failure.
    pub fn suggested_retry(&self) -> Option<RetryHint> {
        self.suggested_retry
    }

    pub fn stats(&self) -> &BearerStats {
        &self.stats
    }

    /// Whether this bearer serves the given APN types.
    pub fn serves(&self, types: ApnTypes) -> bool {
        self.apn_profile
            .as_ref()
            .is_some_and(|p| p.can_serve(types))
    }

    // ─── Machine engine ─────────────────────────────────────────────────

    /// Process one event to completion, including any state transitions
    /// and deferred events they release.
    pub(crate) fn process(&mut self, event: BearerEvent, host: &mut HostCtx<'_>) {
        let mut queue: VecDeque<BearerEvent> = VecDeque::new();
        queue.push_back(event);
        while let Some(ev) = queue.pop_front() {
            self.dispatch(ev, host);
            while let Some(target) = self.pending_transition.take() {
                let released = self.perform_transition(target, host);
                // Deferred events are re-presented ahead of anything else,
                // in their original order.
                for (slot, ev) in released.into_iter().enumerate() {
                    queue.insert(slot, ev);
                }
            }
        }
    }

    fn dispatch(&mut self, event: BearerEvent, host: &mut HostCtx<'_>) {
        let mut state = self.state;
        let mut ev = event;
        loop {
            ev = match self.handle_in(state, ev, host) {
                None => return,
                Some(unhandled) => unhandled,
            };
            match state.parent() {
                Some(parent) => state = parent,
                None => {
                    debug!(
                        bearer = %self.name,
                        state = self.state.as_str(),
                        event = ev.name(),
                        "event not handled"
                    );
                    return;
                }
            }
        }
    }

    fn handle_in(
        &mut self,
        state: StateId,
        ev: BearerEvent,
        host: &mut HostCtx<'_>,
    ) -> Option<BearerEvent> {
        match state {
            StateId::Default => self.handle_default(ev, host),
            StateId::Inactive => self.handle_inactive(ev, host),
            StateId::Activating => self.handle_activating(ev, host),
            StateId::Active => self.handle_active(ev, host),
            StateId::Disconnecting => self.handle_disconnecting(ev),
            StateId::DisconnectingSetupError => self.handle_disconnecting_setup_error(ev),
        }
    }

    fn transition(&mut self, target: StateId) {
        self.pending_transition = Some(target);
    }

    fn perform_transition(
        &mut self,
        target: StateId,
        host: &mut HostCtx<'_>,
    ) -> Vec<BearerEvent> {
        let from = self.state;
        self.exit_state(from, host);
        self.state = target;
        debug!(
            bearer = %self.name,
            from = from.as_str(),
            to = target.as_str(),
            "state transition"
        );
        self.enter_state(target, host);
        std::mem::take(&mut self.deferred)
    }

    fn exit_state(&mut self, state: StateId, host: &mut HostCtx<'_>) {
        if state == StateId::Active {
            self.exit_active(host);
        }
    }

    fn enter_state(&mut self, state: StateId, host: &mut HostCtx<'_>) {
        match state {
            StateId::Inactive => self.enter_inactive(host),
            StateId::Activating => self.enter_activating(),
            StateId::Active => self.enter_active(host),
            _ => {}
        }
    }

    fn defer(&mut self, ev: BearerEvent) {
        debug!(
            bearer = %self.name,
            state = self.state.as_str(),
            event = ev.name(),
            "event deferred"
        );
        self.deferred.push(ev);
    }

    // ─── Default (parent) ───────────────────────────────────────────────

    fn handle_default(
        &mut self,
        ev: BearerEvent,
        host: &mut HostCtx<'_>,
    ) -> Option<BearerEvent> {
        match ev {
            BearerEvent::Reset => {
                self.transition(StateId::Inactive);
                None
            }
            BearerEvent::Connect(params) => {
                // Connect is only meaningful in Inactive and Active; both
                // handle it before this fallback is reached.
                warn!(bearer = %self.name, state = self.state.as_str(), "unexpected connect");
                self.fail_connect_request(&params, FailCause::Unknown);
                None
            }
            ev @ (BearerEvent::Disconnect(_)
            | BearerEvent::DisconnectAll(_)
            | BearerEvent::ReevaluateRestricted) => {
                self.defer(ev);
                None
            }
            BearerEvent::TearDownNow => {
                if self.cid >= 0 {
                    host.driver
                        .deactivate_data_call(self.cid, DeactivateReason::Normal, None);
                }
                None
            }
            BearerEvent::LostConnection => {
                debug!(bearer = %self.name, "lost connection ignored, bearer not active");
                None
            }
            BearerEvent::SetupDataCallDone { tag, .. } | BearerEvent::DeactivateDone { tag } => {
                // A reply that outlived its attempt; the tag can no longer
                // match anything in flight.
                self.stats.stale_replies += 1;
                debug!(
                    bearer = %self.name,
                    reply_tag = tag,
                    tag = self.tag,
                    state = self.state.as_str(),
                    "late driver reply dropped"
                );
                None
            }
            BearerEvent::DataRegChanged(reg) => {
                self.on_data_reg_changed(reg);
                None
            }
            BearerEvent::NrStateChanged(nr) => {
                self.reg.nr_state = nr;
                None
            }
            BearerEvent::NrFrequencyChanged(freq) => {
                self.reg.nr_frequency = freq;
                self.refresh_and_push(false);
                None
            }
            BearerEvent::RoamOn => {
                self.reg.roaming = true;
                self.refresh_and_push(false);
                None
            }
            BearerEvent::RoamOff => {
                self.reg.roaming = false;
                self.refresh_and_push(false);
                None
            }
            BearerEvent::UnmeteredOverrideChanged(unmetered) => {
                self.overrides.unmetered = unmetered;
                self.refresh_and_push(false);
                None
            }
            BearerEvent::SubscriptionOverrideChanged { mask, value } => {
                self.overrides.subscription = self.overrides.subscription.apply(mask, value);
                self.refresh_and_push(false);
                None
            }
            BearerEvent::KeepaliveStartRequest { slot, .. }
            | BearerEvent::KeepaliveStopRequest { slot } => {
                if let Some(agent) = &self.network_agent {
                    agent.on_keepalive_event(slot, KeepaliveStatus::InvalidNetwork);
                }
                None
            }
            other => Some(other),
        }
    }

    fn on_data_reg_changed(&mut self, reg: DataRegState) {
        if reg != self.reg {
            debug!(bearer = %self.name, rat = %reg.rat, in_service = reg.in_service, "data registration changed");
        }
        self.reg = reg;
        self.update_tcp_buffers();
        self.refresh_and_push(true);
    }

    // ─── Inactive ───────────────────────────────────────────────────────

    fn enter_inactive(&mut self, host: &mut HostCtx<'_>) {
        self.tag = self.tag.wrapping_add(1);

        if self.handover_state == HandoverState::BeingTransferred {
            // We were the handover source; the surface now belongs to the
            // destination.
            self.handover_state = HandoverState::Completed;
            self.network_agent = None;
        }

        if let Some(agent) = self.handover_source_agent.take() {
            // Failed handover destination left holding the source's
            // surface: own it just long enough to tell upstream it died.
            agent.acquire_ownership(self.id, self.transport);
            agent.send_network_info(&self.network_info_with(
                DetailedState::Disconnected,
                Some("handover failed"),
            ));
            agent.release_ownership(self.id);
        }
        self.handover_source = None;

        let arm = self.inactive_arm.take();
        let retain = matches!(
            &arm,
            Some(InactiveArm::ConnectFailed { cause: FailCause::Modem(cause), .. })
                if self.config.retains_on_reject(*cause)
        );

        match arm {
            Some(InactiveArm::ConnectFailed { cause, retry }) => {
                self.record_failure(cause);
                let trigger = self.pending_completion.as_ref().map(|p| p.ctx_id);
                self.notify_connect_completed(cause, retry);
                self.notify_all(cause, trigger);
            }
            Some(InactiveArm::Disconnected(dp)) => {
                self.notify_disconnect_completed(&dp);
                self.notify_all(FailCause::None, None);
            }
            None => {
                // Reset path (or the very first entry, where both of
                // these are no-ops).
                if self.pending_completion.is_some() {
                    self.record_failure(FailCause::LostConnection);
                }
                let trigger = self.pending_completion.as_ref().map(|p| p.ctx_id);
                self.notify_connect_completed(FailCause::LostConnection, None);
                self.notify_all(FailCause::LostConnection, trigger);
            }
        }

        if self.cid >= 0 {
            host.active_cids.remove(&self.cid);
        }

        if retain {
            // Keep the profile, link snapshot, and saved connect params
            // visible so the tracker can inspect the reject and re-post a
            // retry.
            self.consumers.clear();
            self.pending_disconnect = None;
            self.cid = -1;
            self.score = SCORE_OTHER;
            debug!(bearer = %self.name, "settings retained after modem reject");
        } else {
            self.clear_settings();
        }
    }

    fn clear_settings(&mut self) {
        self.consumers.clear();
        self.apn_profile = None;
        self.connection_params = None;
        self.pending_completion = None;
        self.pending_disconnect = None;
        self.link_properties = LinkProperties::default();
        self.capabilities = NetCapabilities::default();
        self.disabled_types = ApnTypes::NONE;
        self.overrides = Overrides::default();
        self.modem_bandwidth = None;
        self.voice_call_active = false;
        self.cid = -1;
        self.score = SCORE_OTHER;
    }

    fn handle_inactive(
        &mut self,
        ev: BearerEvent,
        host: &mut HostCtx<'_>,
    ) -> Option<BearerEvent> {
        match ev {
            BearerEvent::Reset => {
                debug!(bearer = %self.name, "reset while inactive is a no-op");
                None
            }
            BearerEvent::Connect(params) => {
                self.on_connect(params, host);
                None
            }
            BearerEvent::Disconnect(dp) | BearerEvent::DisconnectAll(dp) => {
                // Nothing to disconnect; reply immediately.
                self.notify_disconnect_completed(&dp);
                None
            }
            BearerEvent::RetryConnection => {
                match self.connection_params.clone() {
                    Some(params) => {
                        info!(bearer = %self.name, apn = %params.ctx.profile.apn, "retrying saved connect attempt");
                        self.on_connect(params, host);
                    }
                    None => debug!(bearer = %self.name, "retry requested with no saved attempt"),
                }
                None
            }
            other => Some(other),
        }
    }

    fn on_connect(&mut self, mut params: ConnectionParams, host: &mut HostCtx<'_>) {
        if !self.init_connection(&mut params) {
            warn!(
                bearer = %self.name,
                requested = %params.ctx.apn_type,
                serving = %self.apn_profile.as_ref().map(|p| p.types).unwrap_or(ApnTypes::NONE),
                "profile incompatible with requested apn type"
            );
            self.fail_connect_request(&params, FailCause::UnacceptableNetworkParameter);
            return;
        }

        let mut handover_lp = None;
        if params.request_type == RequestType::Handover {
            self.stats.handovers_started += 1;
            match self.prepare_handover(&params, host) {
                Ok(lp) => handover_lp = Some(lp),
                Err(cause) => {
                    warn!(bearer = %self.name, %cause, "handover source unavailable");
                    self.consumers.remove(&params.ctx.id);
                    self.record_failure(cause);
                    self.notify_connect_completed(cause, None);
                    if self.consumers.is_empty() {
                        self.apn_profile = None;
                        self.connection_params = None;
                    }
                    return;
                }
            }
        }

        let Some(profile) = self.apn_profile.clone() else {
            self.fail_connect_request(&params, FailCause::Unknown);
            return;
        };

        let request = SetupRequest {
            rat: params.rat,
            profile,
            modem_roaming: self.reg.roaming,
            allow_roaming: true,
            reason: match params.request_type {
                RequestType::Handover => SetupReason::Handover,
                RequestType::Normal => SetupReason::Normal,
            },
            handover_link_properties: handover_lp,
        };
        self.stats.setup_attempts += 1;
        info!(
            bearer = %self.name,
            apn = %request.profile.apn,
            rat = %request.rat,
            reason = ?request.reason,
            tag = self.tag,
            "requesting data call setup"
        );
        host.driver.setup_data_call(
            request,
            ReplyEnvelope::new(host.events.clone(), self.id, self.tag),
        );
        self.transition(StateId::Activating);
    }

    /// Register a consumer attachment. Bumps the tag, stamps the params,
    /// and inserts the consumer. Fails only when the profile cannot serve
    /// the requested APN type.
    fn init_connection(&mut self, params: &mut ConnectionParams) -> bool {
        match &self.apn_profile {
            Some(profile) if !profile.can_serve(params.ctx.apn_type) => return false,
            Some(_) => {}
            None => self.apn_profile = Some(params.ctx.profile.clone()),
        }

        self.tag = self.tag.wrapping_add(1);
        params.tag = self.tag;
        self.pending_completion = Some(PendingCompletion {
            sender: params.on_completed.clone(),
            ctx_id: params.ctx.id,
            generation: params.generation,
            request_type: params.request_type,
        });
        self.consumers.insert(params.ctx.id, params.clone());
        self.connection_params = Some(params.clone());
        true
    }

    /// Locate the live bearer on the opposite transport and snapshot what
    /// the destination needs from it.
    fn prepare_handover(
        &mut self,
        params: &ConnectionParams,
        host: &mut HostCtx<'_>,
    ) -> Result<LinkProperties, FailCause> {
        let Some((source_id, source)) =
            host.handover_source(self.transport.opposite(), params.ctx.apn_type)
        else {
            return Err(FailCause::HandoverFailed);
        };
        let Some((lp, agent)) = source.begin_transfer() else {
            return Err(FailCause::HandoverFailed);
        };
        info!(
            bearer = %self.name,
            source = %source.name(),
            apn_type = %params.ctx.apn_type,
            "handover window opened"
        );
        self.handover_source_agent = agent;
        self.handover_source = Some(source_id);
        Ok(lp)
    }

    /// Source half of the handover window: snapshot the link and hand out
    /// a non-owning agent reference.
    pub(crate) fn begin_transfer(&mut self) -> Option<(LinkProperties, Option<AgentHandle>)> {
        if self.state != StateId::Active || self.link_properties.is_empty() {
            return None;
        }
        self.handover_state = HandoverState::BeingTransferred;
        Some((self.link_properties.clone(), self.network_agent.clone()))
    }

    pub(crate) fn surrender_agent(&mut self) -> Option<AgentHandle> {
        self.network_agent.take()
    }

    // ─── Activating ─────────────────────────────────────────────────────

    fn enter_activating(&mut self) {
        self.handover_state = HandoverState::Idle;
        // The agent contract forbids *adding* restrictions after the
        // surface exists, so the restriction decision happens here, before
        // Active creates it.
        self.overrides.restricted = self.needs_restricted();
        self.overrides.unmetered_use_only =
            !self.consumers.is_empty() && self.consumers.values().all(|p| p.ctx.unmetered_only);
    }

    fn needs_restricted(&self) -> bool {
        let metered = self
            .apn_profile
            .as_ref()
            .is_some_and(|p| p.is_metered(self.config.metered_types));
        metered && self.consumers.values().any(|p| p.ctx.restricted)
    }

    fn handle_activating(
        &mut self,
        ev: BearerEvent,
        host: &mut HostCtx<'_>,
    ) -> Option<BearerEvent> {
        match ev {
            ev @ (BearerEvent::Connect(_) | BearerEvent::DataRegChanged(_)) => {
                self.defer(ev);
                None
            }
            BearerEvent::SetupDataCallDone { tag, reply } => {
                self.on_setup_done(tag, reply, host);
                None
            }
            other => Some(other),
        }
    }

    fn on_setup_done(
        &mut self,
        tag: u32,
        reply: Result<DataCallResponse, DriverFault>,
        host: &mut HostCtx<'_>,
    ) {
        if tag != self.tag {
            self.stats.stale_replies += 1;
            debug!(bearer = %self.name, reply_tag = tag, tag = self.tag, "stale setup reply dropped");
            return;
        }

        let resp = match reply {
            Err(DriverFault::RadioNotAvailable) => {
                self.inactive_arm = Some(InactiveArm::ConnectFailed {
                    cause: FailCause::RadioNotAvailable,
                    retry: None,
                });
                self.transition(StateId::Inactive);
                return;
            }
            Ok(resp) => resp,
        };

        let Some(profile) = self.apn_profile.clone() else {
            self.inactive_arm = Some(InactiveArm::ConnectFailed {
                cause: FailCause::Unknown,
                retry: None,
            });
            self.transition(StateId::Inactive);
            return;
        };

        match link::build_link_properties(
            &resp,
            &profile,
            &self.reg,
            &self.config,
            Some(&self.link_properties),
        ) {
            Ok(lp) => {
                self.cid = resp.cid;
                self.link_properties = lp;
                host.active_cids.insert(self.cid, self.id);
                self.transition(StateId::Active);
            }
            Err(LinkError::Modem { cause, retry }) => {
                info!(bearer = %self.name, cause, ?retry, "modem rejected data call");
                self.suggested_retry = Some(retry);
                self.inactive_arm = Some(InactiveArm::ConnectFailed {
                    cause: FailCause::Modem(cause),
                    retry: Some(retry),
                });
                self.transition(StateId::Inactive);
            }
            Err(LinkError::InvalidArg(reason)) => {
                warn!(bearer = %self.name, reason, "unusable setup response, tearing call down");
                if resp.cid >= 0 {
                    host.driver.deactivate_data_call(
                        resp.cid,
                        DeactivateReason::Normal,
                        Some(ReplyEnvelope::new(host.events.clone(), self.id, self.tag)),
                    );
                    self.transition(StateId::DisconnectingSetupError);
                } else {
                    self.inactive_arm = Some(InactiveArm::ConnectFailed {
                        cause: FailCause::UnacceptableNetworkParameter,
                        retry: None,
                    });
                    self.transition(StateId::Inactive);
                }
            }
        }
    }

    // ─── Active ─────────────────────────────────────────────────────────

    fn enter_active(&mut self, host: &mut HostCtx<'_>) {
        self.stats.setup_successes += 1;
        self.update_tcp_buffers();
        self.capabilities = self.synthesize_caps();
        self.score = self.compute_score();
        host.driver.register_call_listener(self.id);

        let trigger = self.pending_completion.as_ref().map(|p| p.ctx_id);
        self.notify_connect_completed(FailCause::None, None);
        self.notify_all(FailCause::None, trigger);

        let info = self.network_info();
        if let Some(agent) = self.handover_source_agent.take() {
            // Take the surface over from the handover source inside this
            // single dispatched event; upstream never sees a gap.
            if let Some(source_id) = self.handover_source.take() {
                if let Some(source) = host.peers.get_mut(&source_id) {
                    source.surrender_agent();
                }
            }
            agent.acquire_ownership(self.id, self.transport);
            agent.send_network_info(&info);
            agent.send_capabilities(&self.capabilities);
            agent.send_link_properties(&self.link_properties);
            agent.send_score(self.score);
            self.network_agent = Some(agent);
            self.stats.handovers_completed += 1;
            info!(bearer = %self.name, cid = self.cid, "handover complete, agent adopted");
        } else {
            let agent = host.agents.create(
                self.id,
                &self.name,
                &info,
                &self.link_properties,
                &self.capabilities,
                self.score,
            );
            agent.acquire_ownership(self.id, self.transport);
            self.network_agent = Some(agent);
        }
        self.handover_source = None;
        info!(
            bearer = %self.name,
            cid = self.cid,
            iface = %self.link_properties.interface_name,
            score = self.score,
            "data call active"
        );
    }

    fn exit_active(&mut self, host: &mut HostCtx<'_>) {
        host.driver.unregister_call_listener(self.id);
        self.keepalives.clear();
        if self.handover_state == HandoverState::BeingTransferred {
            // Surface ownership follows the handover destination; nothing
            // to release here.
        } else if let Some(agent) = self.network_agent.take() {
            agent.send_network_info(&self.network_info_with(DetailedState::Disconnected, None));
            agent.release_ownership(self.id);
        }
    }

    fn handle_active(
        &mut self,
        ev: BearerEvent,
        host: &mut HostCtx<'_>,
    ) -> Option<BearerEvent> {
        match ev {
            BearerEvent::Connect(mut params) => {
                if !self.init_connection(&mut params) {
                    self.fail_connect_request(&params, FailCause::UnacceptableNetworkParameter);
                    return None;
                }
                self.disabled_types.remove(params.ctx.apn_type);
                self.refresh_and_push(false);
                self.notify_connect_completed(FailCause::None, None);
                debug!(
                    bearer = %self.name,
                    ctx = params.ctx.id,
                    consumers = self.consumers.len(),
                    "consumer attached to live bearer"
                );
                None
            }
            BearerEvent::Disconnect(dp) => {
                self.on_active_disconnect(dp, host);
                None
            }
            BearerEvent::DisconnectAll(dp) => {
                self.tear_down(dp, host);
                None
            }
            BearerEvent::LostConnection => {
                warn!(bearer = %self.name, cid = self.cid, "network dropped the data call");
                self.inactive_arm = Some(InactiveArm::ConnectFailed {
                    cause: FailCause::LostConnection,
                    retry: None,
                });
                self.transition(StateId::Inactive);
                None
            }
            BearerEvent::ReevaluateRestricted => {
                if self.overrides.restricted && !self.needs_restricted() {
                    // Restrictions may only be lifted, never re-imposed,
                    // while the agent exists.
                    self.overrides.restricted = false;
                    self.refresh_and_push(false);
                }
                None
            }
            BearerEvent::ReevaluateProperties => {
                let score = self.compute_score();
                if score != self.score {
                    self.score = score;
                    if let Some(agent) = &self.network_agent {
                        agent.send_score(score);
                    }
                }
                None
            }
            BearerEvent::BwRefreshDone { down_kbps, up_kbps }
            | BearerEvent::LinkCapacityChanged { down_kbps, up_kbps } => {
                if self.config.bandwidth_source == BandwidthSource::Modem {
                    self.modem_bandwidth = Some((down_kbps, up_kbps));
                    self.capabilities.link_down_kbps = down_kbps;
                    self.capabilities.link_up_kbps = up_kbps;
                    if let Some(agent) = &self.network_agent {
                        agent.send_capabilities(&self.capabilities);
                    }
                }
                None
            }
            BearerEvent::VoiceCallStarted => {
                self.voice_call_active = true;
                self.push_network_info();
                None
            }
            BearerEvent::VoiceCallEnded => {
                self.voice_call_active = false;
                self.push_network_info();
                None
            }
            BearerEvent::NrStateChanged(nr) => {
                self.reg.nr_state = nr;
                self.update_tcp_buffers();
                if let Some(agent) = &self.network_agent {
                    agent.send_link_properties(&self.link_properties);
                }
                None
            }
            BearerEvent::KeepaliveStartRequest { slot, packet, interval } => {
                if self.transport == Transport::Wlan {
                    if let Some(agent) = &self.network_agent {
                        agent.on_keepalive_event(slot, KeepaliveStatus::InvalidNetwork);
                    }
                } else {
                    self.keepalives.start_requested(slot);
                    host.driver
                        .start_natt_keepalive(self.cid, slot, packet, interval);
                }
                None
            }
            BearerEvent::KeepaliveStopRequest { slot } => {
                if self.transport == Transport::Wlan {
                    if let Some(agent) = &self.network_agent {
                        agent.on_keepalive_event(slot, KeepaliveStatus::InvalidNetwork);
                    }
                } else {
                    match self.keepalives.stop_requested(slot) {
                        Some(handle) => host.driver.stop_natt_keepalive(handle),
                        None => {
                            debug!(bearer = %self.name, slot, "keepalive stop for unknown slot")
                        }
                    }
                }
                None
            }
            BearerEvent::KeepaliveStarted { slot, handle, status } => {
                if status == KeepaliveStatus::Success {
                    self.keepalives.started(slot, handle);
                } else {
                    self.keepalives.start_failed(slot);
                }
                if let Some(agent) = &self.network_agent {
                    agent.on_keepalive_event(slot, status);
                }
                None
            }
            BearerEvent::KeepaliveStatusChanged { handle, status } => {
                if let Some(slot) = self.keepalives.slot_for_handle(handle) {
                    if let Some(agent) = &self.network_agent {
                        agent.on_keepalive_event(slot, status);
                    }
                }
                None
            }
            BearerEvent::KeepaliveStopped { handle } => {
                if let Some(slot) = self.keepalives.stopped(handle) {
                    if let Some(agent) = &self.network_agent {
                        agent.on_keepalive_event(slot, KeepaliveStatus::Success);
                    }
                }
                None
            }
            other => Some(other),
        }
    }

    fn on_active_disconnect(&mut self, dp: DisconnectParams, host: &mut HostCtx<'_>) {
        let Some(ctx_id) = dp.ctx_id else {
            self.tear_down(dp, host);
            return;
        };
        if !self.consumers.contains_key(&ctx_id) {
            warn!(bearer = %self.name, ctx = ctx_id, "disconnect for unknown consumer");
            self.notify_disconnect_completed(&dp);
            return;
        }
        if self.consumers.len() == 1 {
            self.tear_down(dp, host);
            return;
        }
        let removed = self.consumers.remove(&ctx_id);
        if let Some(params) = removed {
            self.disabled_types.insert(params.ctx.apn_type);
        }
        self.refresh_and_push(false);
        self.notify_disconnect_completed(&dp);
        debug!(
            bearer = %self.name,
            ctx = ctx_id,
            consumers = self.consumers.len(),
            "consumer detached from live bearer"
        );
    }

    fn tear_down(&mut self, dp: DisconnectParams, host: &mut HostCtx<'_>) {
        let reason = match dp.release {
            ReleaseType::Handover => DeactivateReason::Handover,
            _ if dp.reason == "shutdown" || dp.reason == "radio_off" => DeactivateReason::Shutdown,
            _ => DeactivateReason::Normal,
        };
        info!(
            bearer = %self.name,
            cid = self.cid,
            reason = %dp.reason,
            mode = ?reason,
            "tearing down data call"
        );
        self.stats.teardowns += 1;
        self.pending_disconnect = Some(dp);
        host.driver.deactivate_data_call(
            self.cid,
            reason,
            Some(ReplyEnvelope::new(host.events.clone(), self.id, self.tag)),
        );
        self.transition(StateId::Disconnecting);
    }

    // ─── Disconnecting ──────────────────────────────────────────────────

    fn handle_disconnecting(&mut self, ev: BearerEvent) -> Option<BearerEvent> {
        match ev {
            BearerEvent::DeactivateDone { tag } => {
                if tag == self.tag {
                    let dp = self.pending_disconnect.take().unwrap_or(DisconnectParams {
                        ctx_id: None,
                        reason: "deactivate".into(),
                        release: ReleaseType::Normal,
                        on_completed: None,
                    });
                    self.inactive_arm = Some(InactiveArm::Disconnected(dp));
                    self.transition(StateId::Inactive);
                } else {
                    self.stats.stale_replies += 1;
                    debug!(bearer = %self.name, reply_tag = tag, "stale deactivate reply dropped");
                }
                None
            }
            ev @ BearerEvent::Connect(_) => {
                self.defer(ev);
                None
            }
            other => Some(other),
        }
    }

    fn handle_disconnecting_setup_error(&mut self, ev: BearerEvent) -> Option<BearerEvent> {
        match ev {
            BearerEvent::DeactivateDone { tag } => {
                if tag == self.tag {
                    self.inactive_arm = Some(InactiveArm::ConnectFailed {
                        cause: FailCause::UnacceptableNetworkParameter,
                        retry: None,
                    });
                    self.transition(StateId::Inactive);
                } else {
                    self.stats.stale_replies += 1;
                    debug!(bearer = %self.name, reply_tag = tag, "stale deactivate reply dropped");
                }
                None
            }
            ev @ BearerEvent::Connect(_) => {
                self.defer(ev);
                None
            }
            other => Some(other),
        }
    }

    // ─── Derivation and notification helpers ────────────────────────────

    fn synthesize_caps(&self) -> NetCapabilities {
        let Some(profile) = &self.apn_profile else {
            return NetCapabilities::default();
        };
        let mut nc = caps::synthesize(&CapsContext {
            profile,
            disabled_types: self.disabled_types,
            overrides: &self.overrides,
            reg: &self.reg,
            sub_id: self.sub_id,
            config: &self.config,
        });
        if self.config.bandwidth_source == BandwidthSource::Modem {
            if let Some((down, up)) = self.modem_bandwidth {
                nc.link_down_kbps = down;
                nc.link_up_kbps = up;
            }
        }
        nc
    }

    fn compute_score(&self) -> u8 {
        caps::score(self.consumers.values().map(|p| &p.ctx))
    }

    fn update_tcp_buffers(&mut self) {
        self.link_properties.tcp_buffer_sizes =
            tcp_buffers::select(&self.reg, &self.config.tcp_buffer_overrides);
    }

    /// Re-derive capabilities and score, and push the refreshed view to
    /// the agent when one exists.
    fn refresh_and_push(&mut self, link_properties_too: bool) {
        self.capabilities = self.synthesize_caps();
        let score = self.compute_score();
        if let Some(agent) = &self.network_agent {
            agent.send_capabilities(&self.capabilities);
            if link_properties_too {
                agent.send_link_properties(&self.link_properties);
            }
            agent.send_network_info(&self.network_info());
            if score != self.score {
                agent.send_score(score);
            }
        }
        self.score = score;
    }

    fn push_network_info(&self) {
        if let Some(agent) = &self.network_agent {
            agent.send_network_info(&self.network_info());
        }
    }

    fn network_info(&self) -> NetworkInfo {
        let detailed = match self.state {
            StateId::Active => {
                if caps::suspended(&self.reg, self.voice_call_active) {
                    DetailedState::Suspended
                } else {
                    DetailedState::Connected
                }
            }
            StateId::Activating => DetailedState::Connecting,
            _ => DetailedState::Disconnected,
        };
        self.network_info_with(detailed, None)
    }

    fn network_info_with(&self, detailed: DetailedState, reason: Option<&str>) -> NetworkInfo {
        NetworkInfo {
            detailed,
            rat: self.reg.rat,
            reason: reason.map(str::to_owned),
            apn: self
                .apn_profile
                .as_ref()
                .map(|p| p.apn.clone())
                .unwrap_or_default(),
        }
    }

    fn record_failure(&mut self, cause: FailCause) {
        if cause.is_failure() {
            self.last_fail_cause = cause;
            self.last_fail_time = Some(Instant::now());
            self.stats.connect_failures += 1;
        }
    }

    /// Resolve the in-flight attempt's completion callback, exactly once.
    fn notify_connect_completed(&mut self, cause: FailCause, retry: Option<RetryHint>) {
        if let Some(pending) = self.pending_completion.take() {
            let _ = pending.sender.send(ConnectionCompleted {
                ctx_id: pending.ctx_id,
                cause,
                retry_hint: retry,
                generation: pending.generation,
                request_type: pending.request_type,
            });
        }
    }

    /// Best-effort broadcast of a bearer-level outcome to every attached
    /// consumer except `except`.
    fn notify_all(&self, cause: FailCause, except: Option<u32>) {
        for (ctx_id, params) in &self.consumers {
            if Some(*ctx_id) == except {
                continue;
            }
            let _ = params.on_completed.send(ConnectionCompleted {
                ctx_id: *ctx_id,
                cause,
                retry_hint: None,
                generation: params.generation,
                request_type: params.request_type,
            });
        }
    }

    /// Fail a connect request that never became the in-flight attempt.
    fn fail_connect_request(&mut self, params: &ConnectionParams, cause: FailCause) {
        self.record_failure(cause);
        let _ = params.on_completed.send(ConnectionCompleted {
            ctx_id: params.ctx.id,
            cause,
            retry_hint: None,
            generation: params.generation,
            request_type: params.request_type,
        });
    }

    fn notify_disconnect_completed(&self, dp: &DisconnectParams) {
        if let Some(sender) = &dp.on_completed {
            let _ = sender.send(DisconnectCompleted {
                ctx_id: dp.ctx_id,
                reason: dp.reason.clone(),
            });
        }
    }
}

impl std::fmt::Debug for Bearer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bearer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("tag", &self.tag)
            .field("cid", &self.cid)
            .field("consumers", &self.consumers.len())
            .field("handover_state", &self.handover_state)
            .field("score", &self.score)
            .finish()
    }
}
