//! Shared fakes for the bearer integration tests: a scripted data-service
//! driver and a recording network agent, plus a synchronous harness that
//! pumps the dispatcher on the test thread.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use talus_bearer::agent::{AgentFactory, AgentHandle, NetworkAgent, NetworkInfo};
use talus_bearer::caps::NetCapabilities;
use talus_bearer::config::PlatformConfig;
use talus_bearer::dispatcher::{BearerRuntime, Dispatcher};
use talus_bearer::driver::{
    DataCallResponse, DataService, DeactivateReason, DriverFault, ReplyEnvelope, SetupRequest,
};
use talus_bearer::event::{
    ApnContext, BearerId, ConnectionCompleted, EventSender, RequestType,
};
use talus_bearer::keepalive::{KeepalivePacket, KeepaliveStatus};
use talus_bearer::link::{LinkAddress, LinkProperties};
use talus_common::apn::{ApnProfile, ApnTypes, AuthType, PdpProtocol};
use talus_common::radio::{DataRegState, RadioTech, Transport};

// ─── Scripted driver ────────────────────────────────────────────────────────

/// How the fake driver answers the next `setup_data_call`.
pub enum SetupScript {
    Reply(Result<DataCallResponse, DriverFault>),
    /// Keep the envelope; the test releases it later (possibly after the
    /// bearer's tag has moved on).
    Hold,
}

#[derive(Default)]
pub struct DriverState {
    pub script: VecDeque<SetupScript>,
    pub setup_requests: Vec<SetupRequest>,
    pub pending_setup: Option<ReplyEnvelope>,
    /// When set, deactivate replies are held instead of answered inline.
    pub hold_deactivate: bool,
    pub pending_deactivate: Option<ReplyEnvelope>,
    /// (cid, reason, reply expected)
    pub deactivations: Vec<(i32, DeactivateReason, bool)>,
    pub state_listeners: Vec<BearerId>,
    pub call_listeners: Vec<BearerId>,
    pub call_unregisters: Vec<BearerId>,
    pub keepalive_starts: Vec<(i32, u32)>,
    pub keepalive_stops: Vec<u32>,
}

pub struct ScriptedDriver {
    state: Arc<Mutex<DriverState>>,
}

impl DataService for ScriptedDriver {
    fn setup_data_call(&mut self, request: SetupRequest, reply: ReplyEnvelope) {
        let mut state = self.state.lock().unwrap();
        state.setup_requests.push(request);
        match state.script.pop_front() {
            Some(SetupScript::Reply(r)) => reply.setup_done(r),
            Some(SetupScript::Hold) | None => state.pending_setup = Some(reply),
        }
    }

    fn deactivate_data_call(
        &mut self,
        cid: i32,
        reason: DeactivateReason,
        reply: Option<ReplyEnvelope>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.deactivations.push((cid, reason, reply.is_some()));
        if let Some(envelope) = reply {
            if state.hold_deactivate {
                state.pending_deactivate = Some(envelope);
            } else {
                envelope.deactivate_done();
            }
        }
    }

    fn start_natt_keepalive(
        &mut self,
        cid: i32,
        slot: u32,
        _packet: KeepalivePacket,
        _interval: Duration,
    ) {
        self.state.lock().unwrap().keepalive_starts.push((cid, slot));
    }

    fn stop_natt_keepalive(&mut self, handle: u32) {
        self.state.lock().unwrap().keepalive_stops.push(handle);
    }

    fn register_state_listener(&mut self, bearer: BearerId, _events: EventSender) {
        self.state.lock().unwrap().state_listeners.push(bearer);
    }

    fn unregister_state_listener(&mut self, bearer: BearerId) {
        self.state
            .lock()
            .unwrap()
            .state_listeners
            .retain(|b| *b != bearer);
    }

    fn register_call_listener(&mut self, bearer: BearerId) {
        self.state.lock().unwrap().call_listeners.push(bearer);
    }

    fn unregister_call_listener(&mut self, bearer: BearerId) {
        self.state.lock().unwrap().call_unregisters.push(bearer);
    }
}

// ─── Recording agent ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    LinkProperties(LinkProperties),
    Capabilities(NetCapabilities),
    Info(NetworkInfo),
    Score(u8),
    Keepalive(u32, KeepaliveStatus),
    Acquire(BearerId, Transport),
    Release(BearerId),
}

pub struct RecordingAgent {
    pub calls: Mutex<Vec<AgentCall>>,
}

impl RecordingAgent {
    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn infos(&self) -> Vec<NetworkInfo> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                AgentCall::Info(info) => Some(info),
                _ => None,
            })
            .collect()
    }

    pub fn last_capabilities(&self) -> Option<NetCapabilities> {
        self.calls()
            .into_iter()
            .rev()
            .find_map(|c| match c {
                AgentCall::Capabilities(nc) => Some(nc),
                _ => None,
            })
    }
}

impl NetworkAgent for RecordingAgent {
    fn send_link_properties(&self, lp: &LinkProperties) {
        self.calls
            .lock()
            .unwrap()
            .push(AgentCall::LinkProperties(lp.clone()));
    }

    fn send_capabilities(&self, caps: &NetCapabilities) {
        self.calls
            .lock()
            .unwrap()
            .push(AgentCall::Capabilities(caps.clone()));
    }

    fn send_network_info(&self, info: &NetworkInfo) {
        self.calls.lock().unwrap().push(AgentCall::Info(info.clone()));
    }

    fn send_score(&self, score: u8) {
        self.calls.lock().unwrap().push(AgentCall::Score(score));
    }

    fn on_keepalive_event(&self, slot: u32, status: KeepaliveStatus) {
        self.calls
            .lock()
            .unwrap()
            .push(AgentCall::Keepalive(slot, status));
    }

    fn acquire_ownership(&self, owner: BearerId, transport: Transport) {
        self.calls
            .lock()
            .unwrap()
            .push(AgentCall::Acquire(owner, transport));
    }

    fn release_ownership(&self, owner: BearerId) {
        self.calls.lock().unwrap().push(AgentCall::Release(owner));
    }
}

pub struct RecordingAgentFactory {
    created: Arc<Mutex<Vec<Arc<RecordingAgent>>>>,
}

impl AgentFactory for RecordingAgentFactory {
    fn create(
        &mut self,
        _bearer: BearerId,
        _name: &str,
        info: &NetworkInfo,
        lp: &LinkProperties,
        caps: &NetCapabilities,
        score: u8,
    ) -> AgentHandle {
        let agent = Arc::new(RecordingAgent {
            calls: Mutex::new(vec![
                AgentCall::Info(info.clone()),
                AgentCall::LinkProperties(lp.clone()),
                AgentCall::Capabilities(caps.clone()),
                AgentCall::Score(score),
            ]),
        });
        self.created.lock().unwrap().push(agent.clone());
        agent
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

/// Dispatcher plus handles into the fakes, pumped synchronously.
pub struct Harness {
    pub dispatcher: Dispatcher,
    pub driver: Arc<Mutex<DriverState>>,
    pub agents: Arc<Mutex<Vec<Arc<RecordingAgent>>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PlatformConfig::default())
    }

    pub fn with_config(config: PlatformConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let driver = Arc::new(Mutex::new(DriverState::default()));
        let agents = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(
            Box::new(ScriptedDriver {
                state: driver.clone(),
            }),
            Box::new(RecordingAgentFactory {
                created: agents.clone(),
            }),
            config,
        );
        Harness {
            dispatcher,
            driver,
            agents,
        }
    }

    pub fn pump(&mut self) {
        self.dispatcher.run_until_idle();
    }

    pub fn script(&self, entry: SetupScript) {
        self.driver.lock().unwrap().script.push_back(entry);
    }

    pub fn release_setup(&self, reply: Result<DataCallResponse, DriverFault>) {
        let envelope = self
            .driver
            .lock()
            .unwrap()
            .pending_setup
            .take()
            .expect("no held setup reply");
        envelope.setup_done(reply);
    }

    pub fn release_deactivate(&self) {
        let envelope = self
            .driver
            .lock()
            .unwrap()
            .pending_deactivate
            .take()
            .expect("no held deactivate reply");
        envelope.deactivate_done();
    }

    /// Number of agents the factory created so far.
    pub fn agents_created(&self) -> usize {
        self.agents.lock().unwrap().len()
    }

    pub fn agent(&self, slot: usize) -> Arc<RecordingAgent> {
        self.agents.lock().unwrap()[slot].clone()
    }
}

/// Build a threaded [`BearerRuntime`] over the same fakes, returning the
/// handles the tests poke at.
pub fn runtime_fixture() -> (
    BearerRuntime,
    Arc<Mutex<DriverState>>,
    Arc<Mutex<Vec<Arc<RecordingAgent>>>>,
) {
    let driver = Arc::new(Mutex::new(DriverState::default()));
    let agents = Arc::new(Mutex::new(Vec::new()));
    let runtime = BearerRuntime::new(
        Box::new(ScriptedDriver {
            state: driver.clone(),
        }),
        Box::new(RecordingAgentFactory {
            created: agents.clone(),
        }),
        PlatformConfig::default(),
    );
    (runtime, driver, agents)
}

// ─── Fixtures ───────────────────────────────────────────────────────────────

pub fn v4(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn internet_profile() -> ApnProfile {
    ApnProfile {
        entry_name: "Internet".into(),
        apn: "internet".into(),
        proxy: None,
        proxy_port: None,
        mms_proxy: None,
        types: ApnTypes::DEFAULT.union(ApnTypes::SUPL),
        protocol: PdpProtocol::Ipv4v6,
        auth: AuthType::None,
        mtu: 0,
        profile_id: 1,
    }
}

pub fn ims_profile() -> ApnProfile {
    ApnProfile {
        entry_name: "IMS".into(),
        apn: "ims".into(),
        proxy: None,
        proxy_port: None,
        mms_proxy: None,
        types: ApnTypes::IMS,
        protocol: PdpProtocol::Ipv4v6,
        auth: AuthType::None,
        mtu: 0,
        profile_id: 2,
    }
}

pub fn ctx(id: u32, apn_type: ApnTypes, profile: ApnProfile) -> ApnContext {
    ApnContext {
        id,
        apn_type,
        profile,
        specifier: None,
        restricted: false,
        unmetered_only: false,
    }
}

pub fn lte_reg() -> DataRegState {
    DataRegState {
        rat: RadioTech::Lte,
        in_service: true,
        ..Default::default()
    }
}

pub fn ok_response(cid: i32) -> DataCallResponse {
    DataCallResponse {
        cid,
        interface_name: "rmnet0".into(),
        addresses: vec![LinkAddress::new(v4("10.0.0.2"), 24)],
        dns: vec![v4("8.8.8.8")],
        gateways: vec![v4("10.0.0.1")],
        mtu: 1500,
        ..Default::default()
    }
}

/// Post a connect through the outer-tracker API, returning the completion
/// channel. Does not pump.
pub fn bring_up(
    harness: &Harness,
    bearer: BearerId,
    context: ApnContext,
    request_type: RequestType,
) -> Receiver<ConnectionCompleted> {
    let (tx, rx): (Sender<ConnectionCompleted>, _) = unbounded();
    let profile_id = context.profile.profile_id;
    harness.dispatcher.bring_up(
        bearer,
        context,
        profile_id,
        RadioTech::Lte,
        tx,
        1,
        request_type,
        1,
        true,
    );
    rx
}
