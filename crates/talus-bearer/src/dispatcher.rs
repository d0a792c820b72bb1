//! The shared event loop and the worker-thread runtime.
//!
//! One [`Dispatcher`] drives every bearer of a modem in FIFO order on a
//! single thread, so bearers need no internal locking. [`BearerRuntime`]
//! wraps a dispatcher in a named worker thread behind a command channel;
//! all its public methods are non-blocking apart from the request/reply
//! pairs.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use tracing::warn;

use talus_common::apn::ApnTypes;
use talus_common::handover::HandoverState;
use talus_common::radio::{RadioTech, Transport};

use crate::agent::AgentFactory;
use crate::bearer::Bearer;
use crate::caps::NetCapabilities;
use crate::config::PlatformConfig;
use crate::driver::DataService;
use crate::event::{
    ApnContext, BearerEvent, BearerId, ConnectionCompleted, ConnectionParams, DisconnectCompleted,
    DisconnectParams, Envelope, EventSender, ReleaseType, RequestType,
};
use crate::link::LinkProperties;
use crate::machine::StateId;
use crate::stats::BearerStats;

// ─── Host context ───────────────────────────────────────────────────────────

/// Everything a bearer may touch while handling one event.
///
/// The bearer being driven is checked out of the map, so `peers` holds
/// every *other* bearer; cross-bearer work (handover) goes through here
/// and completes within the same dispatched event.
pub struct HostCtx<'a> {
    pub driver: &'a mut dyn DataService,
    pub agents: &'a mut dyn AgentFactory,
    pub events: &'a EventSender,
    pub peers: &'a mut HashMap<BearerId, Bearer>,
    /// cid → bearer for everything currently holding a modem context.
    pub active_cids: &'a mut HashMap<i32, BearerId>,
}

impl HostCtx<'_> {
    /// The live bearer a handover destination would take over from.
    pub(crate) fn handover_source(
        &mut self,
        transport: Transport,
        types: ApnTypes,
    ) -> Option<(BearerId, &mut Bearer)> {
        self.peers
            .iter_mut()
            .find(|(_, b)| b.transport() == transport && b.is_active() && b.serves(types))
            .map(|(id, b)| (*id, b))
    }
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

/// Single-threaded FIFO event pump over a set of bearers.
pub struct Dispatcher {
    events: EventSender,
    rx: Receiver<Envelope>,
    bearers: HashMap<BearerId, Bearer>,
    driver: Box<dyn DataService>,
    agents: Box<dyn AgentFactory>,
    active_cids: HashMap<i32, BearerId>,
    config: Arc<PlatformConfig>,
    next_instance: u32,
}

impl Dispatcher {
    pub fn new(
        driver: Box<dyn DataService>,
        agents: Box<dyn AgentFactory>,
        config: PlatformConfig,
    ) -> Self {
        let (tx, rx) = unbounded();
        Dispatcher {
            events: EventSender::new(tx),
            rx,
            bearers: HashMap::new(),
            driver,
            agents,
            active_cids: HashMap::new(),
            config: Arc::new(config),
            next_instance: 0,
        }
    }

    /// Create a bearer and run its initial state entry. The instance
    /// counter doubles as a tie-breaker in bearer names.
    pub fn add_bearer(&mut self, base_name: &str, transport: Transport, sub_id: i32) -> BearerId {
        self.next_instance += 1;
        let id = BearerId(self.next_instance);
        let name = format!("{base_name}-{}", self.next_instance);
        let mut bearer = Bearer::new(id, name, transport, sub_id, self.config.clone());
        let mut ctx = HostCtx {
            driver: self.driver.as_mut(),
            agents: self.agents.as_mut(),
            events: &self.events,
            peers: &mut self.bearers,
            active_cids: &mut self.active_cids,
        };
        bearer.start(&mut ctx);
        self.bearers.insert(id, bearer);
        id
    }

    pub fn remove_bearer(&mut self, id: BearerId) {
        let Some(mut bearer) = self.bearers.remove(&id) else {
            return;
        };
        let mut ctx = HostCtx {
            driver: self.driver.as_mut(),
            agents: self.agents.as_mut(),
            events: &self.events,
            peers: &mut self.bearers,
            active_cids: &mut self.active_cids,
        };
        bearer.stop(&mut ctx);
    }

    /// Handle for posting events from drivers and outer layers.
    pub fn sender(&self) -> EventSender {
        self.events.clone()
    }

    pub(crate) fn receiver(&self) -> Receiver<Envelope> {
        self.rx.clone()
    }

    /// Drive one envelope through its bearer.
    pub fn process(&mut self, env: Envelope) {
        let Some(mut bearer) = self.bearers.remove(&env.bearer) else {
            warn!(bearer = %env.bearer, event = env.event.name(), "event for unknown bearer");
            return;
        };
        let mut ctx = HostCtx {
            driver: self.driver.as_mut(),
            agents: self.agents.as_mut(),
            events: &self.events,
            peers: &mut self.bearers,
            active_cids: &mut self.active_cids,
        };
        bearer.process(env.event, &mut ctx);
        self.bearers.insert(env.bearer, bearer);
    }

    /// Drain the queue in FIFO order until no event is pending.
    pub fn run_until_idle(&mut self) {
        while let Ok(env) = self.rx.try_recv() {
            self.process(env);
        }
    }

    // ─── Outer-tracker API ──────────────────────────────────────────────

    /// Attach a consumer, bringing the bearer up if needed.
    #[allow(clippy::too_many_arguments)]
    pub fn bring_up(
        &self,
        bearer: BearerId,
        ctx: ApnContext,
        profile_id: u32,
        rat: RadioTech,
        on_completed: Sender<ConnectionCompleted>,
        generation: u32,
        request_type: RequestType,
        sub_id: i32,
        preferred: bool,
    ) {
        self.events.post(
            bearer,
            BearerEvent::Connect(ConnectionParams {
                ctx,
                profile_id,
                rat,
                on_completed,
                generation,
                request_type,
                sub_id,
                preferred,
                tag: 0,
            }),
        );
    }

    pub fn tear_down(
        &self,
        bearer: BearerId,
        ctx_id: u32,
        reason: &str,
        on_completed: Option<Sender<DisconnectCompleted>>,
    ) {
        self.events.post(
            bearer,
            BearerEvent::Disconnect(DisconnectParams {
                ctx_id: Some(ctx_id),
                reason: reason.to_owned(),
                release: ReleaseType::Normal,
                on_completed,
            }),
        );
    }

    pub fn tear_down_all(
        &self,
        bearer: BearerId,
        reason: &str,
        release: ReleaseType,
        on_completed: Option<Sender<DisconnectCompleted>>,
    ) {
        self.events.post(
            bearer,
            BearerEvent::DisconnectAll(DisconnectParams {
                ctx_id: None,
                reason: reason.to_owned(),
                release,
                on_completed,
            }),
        );
    }

    pub fn reset(&self, bearer: BearerId) {
        self.events.post(bearer, BearerEvent::Reset);
    }

    pub fn reevaluate_restricted_state(&self, bearer: BearerId) {
        self.events.post(bearer, BearerEvent::ReevaluateRestricted);
    }

    pub fn reevaluate_data_connection_properties(&self, bearer: BearerId) {
        self.events.post(bearer, BearerEvent::ReevaluateProperties);
    }

    // ─── Observers ──────────────────────────────────────────────────────

    pub fn bearer(&self, id: BearerId) -> Option<&Bearer> {
        self.bearers.get(&id)
    }

    pub fn bearer_by_cid(&self, cid: i32) -> Option<&Bearer> {
        self.active_cids.get(&cid).and_then(|id| self.bearers.get(id))
    }

    pub fn bearer_ids(&self) -> Vec<BearerId> {
        self.bearers.keys().copied().collect()
    }
}

// ─── Snapshots ──────────────────────────────────────────────────────────────

/// Point-in-time copy of a bearer's observable state, for callers outside
/// the dispatcher thread.
#[derive(Debug, Clone)]
pub struct BearerSnapshot {
    pub id: BearerId,
    pub name: String,
    pub transport: Transport,
    pub state: StateId,
    pub cid: i32,
    pub score: u8,
    pub handover_state: HandoverState,
    pub consumers: Vec<ApnContext>,
    pub link_properties: LinkProperties,
    pub capabilities: NetCapabilities,
    pub stats: BearerStats,
}

fn snapshot_of(bearer: &Bearer) -> BearerSnapshot {
    BearerSnapshot {
        id: bearer.id(),
        name: bearer.name().to_owned(),
        transport: bearer.transport(),
        state: bearer.state(),
        cid: bearer.cid(),
        score: bearer.score(),
        handover_state: bearer.handover_state(),
        consumers: bearer.apn_contexts(),
        link_properties: bearer.link_properties().clone(),
        capabilities: bearer.capabilities().clone(),
        stats: bearer.stats().clone(),
    }
}

// ─── Worker-thread runtime ──────────────────────────────────────────────────

enum RuntimeCommand {
    AddBearer {
        base_name: String,
        transport: Transport,
        sub_id: i32,
        reply: Sender<BearerId>,
    },
    RemoveBearer(BearerId),
    Snapshot {
        bearer: BearerId,
        reply: Sender<Option<BearerSnapshot>>,
    },
    Shutdown,
}

/// Thread-safe handle to a dispatcher running on its own worker thread.
///
/// Dropping the runtime triggers a graceful shutdown of the worker.
pub struct BearerRuntime {
    commands: Sender<RuntimeCommand>,
    events: EventSender,
    handle: Option<thread::JoinHandle<()>>,
}

impl BearerRuntime {
    pub fn new(
        driver: Box<dyn DataService>,
        agents: Box<dyn AgentFactory>,
        config: PlatformConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(driver, agents, config);
        let events = dispatcher.sender();
        let (cmd_tx, cmd_rx) = bounded(64);

        let handle = thread::Builder::new()
            .name("talus-bearer-worker".into())
            .spawn(move || runtime_worker(dispatcher, cmd_rx))
            .expect("failed to spawn bearer runtime worker");

        BearerRuntime {
            commands: cmd_tx,
            events,
            handle: Some(handle),
        }
    }

    /// Handle for posting bearer events from other threads.
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn post(&self, bearer: BearerId, event: BearerEvent) {
        self.events.post(bearer, event);
    }

    /// Attach a consumer, bringing the bearer up if needed.
    #[allow(clippy::too_many_arguments)]
    pub fn bring_up(
        &self,
        bearer: BearerId,
        ctx: ApnContext,
        profile_id: u32,
        rat: RadioTech,
        on_completed: Sender<ConnectionCompleted>,
        generation: u32,
        request_type: RequestType,
        sub_id: i32,
        preferred: bool,
    ) {
        self.events.post(
            bearer,
            BearerEvent::Connect(ConnectionParams {
                ctx,
                profile_id,
                rat,
                on_completed,
                generation,
                request_type,
                sub_id,
                preferred,
                tag: 0,
            }),
        );
    }

    pub fn tear_down(
        &self,
        bearer: BearerId,
        ctx_id: u32,
        reason: &str,
        on_completed: Option<Sender<DisconnectCompleted>>,
    ) {
        self.events.post(
            bearer,
            BearerEvent::Disconnect(DisconnectParams {
                ctx_id: Some(ctx_id),
                reason: reason.to_owned(),
                release: ReleaseType::Normal,
                on_completed,
            }),
        );
    }

    pub fn tear_down_all(
        &self,
        bearer: BearerId,
        reason: &str,
        release: ReleaseType,
        on_completed: Option<Sender<DisconnectCompleted>>,
    ) {
        self.events.post(
            bearer,
            BearerEvent::DisconnectAll(DisconnectParams {
                ctx_id: None,
                reason: reason.to_owned(),
                release,
                on_completed,
            }),
        );
    }

    pub fn reset(&self, bearer: BearerId) {
        self.events.post(bearer, BearerEvent::Reset);
    }

    pub fn add_bearer(
        &self,
        base_name: &str,
        transport: Transport,
        sub_id: i32,
    ) -> anyhow::Result<BearerId> {
        let (reply, reply_rx) = bounded(1);
        self.commands
            .send(RuntimeCommand::AddBearer {
                base_name: base_name.to_owned(),
                transport,
                sub_id,
                reply,
            })
            .map_err(|e| anyhow::anyhow!("failed to add bearer: {}", e))?;
        reply_rx
            .recv()
            .map_err(|e| anyhow::anyhow!("bearer worker gone: {}", e))
    }

    pub fn remove_bearer(&self, bearer: BearerId) -> anyhow::Result<()> {
        self.commands
            .send(RuntimeCommand::RemoveBearer(bearer))
            .map_err(|e| anyhow::anyhow!("failed to remove bearer: {}", e))
    }

    pub fn snapshot(&self, bearer: BearerId) -> anyhow::Result<Option<BearerSnapshot>> {
        let (reply, reply_rx) = bounded(1);
        self.commands
            .send(RuntimeCommand::Snapshot { bearer, reply })
            .map_err(|e| anyhow::anyhow!("failed to query bearer: {}", e))?;
        reply_rx
            .recv()
            .map_err(|e| anyhow::anyhow!("bearer worker gone: {}", e))
    }

    /// Gracefully shuts down the worker thread. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(RuntimeCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BearerRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn runtime_worker(mut dispatcher: Dispatcher, commands: Receiver<RuntimeCommand>) {
    let events = dispatcher.receiver();
    loop {
        select! {
            recv(commands) -> msg => match msg {
                Ok(RuntimeCommand::AddBearer { base_name, transport, sub_id, reply }) => {
                    let id = dispatcher.add_bearer(&base_name, transport, sub_id);
                    dispatcher.run_until_idle();
                    let _ = reply.send(id);
                }
                Ok(RuntimeCommand::RemoveBearer(id)) => {
                    dispatcher.remove_bearer(id);
                    dispatcher.run_until_idle();
                }
                Ok(RuntimeCommand::Snapshot { bearer, reply }) => {
                    let _ = reply.send(dispatcher.bearer(bearer).map(snapshot_of));
                }
                Ok(RuntimeCommand::Shutdown) | Err(_) => break,
            },
            recv(events) -> msg => match msg {
                Ok(env) => {
                    dispatcher.process(env);
                    dispatcher.run_until_idle();
                }
                Err(_) => break,
            },
        }
    }
}
