//! End-to-end bearer lifecycle tests: bring-up, failure, multi-consumer
//! reference counting, teardown, staleness, overrides, and keepalives —
//! all driven through the public dispatcher API against the scripted
//! driver and recording agent.

mod common;

use std::time::Duration;

use common::*;
use crossbeam_channel::unbounded;

use talus_bearer::caps::{NetCapability, SubOverrides};
use talus_bearer::driver::DataCallResponse;
use talus_bearer::event::{BearerEvent, BearerId, RequestType};
use talus_bearer::keepalive::{KeepalivePacket, KeepaliveStatus};
use talus_common::apn::ApnTypes;
use talus_common::fail::{FailCause, RetryHint};
use talus_common::radio::{DataRegState, RadioTech, Transport};

fn add_wwan(h: &mut Harness) -> BearerId {
    let id = h.dispatcher.add_bearer("wwan", Transport::Wwan, 1);
    h.dispatcher.sender().post(id, BearerEvent::DataRegChanged(lte_reg()));
    h.pump();
    id
}

// ─── Clean bring-up ─────────────────────────────────────────────────────────

#[test]
fn clean_bring_up_reaches_active() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    h.script(SetupScript::Reply(Ok(ok_response(7))));
    let done = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_active());
    assert_eq!(bearer.cid(), 7);
    assert_eq!(bearer.score(), 50);
    assert!(bearer.capabilities().has(NetCapability::Internet));
    assert!(bearer.capabilities().has(NetCapability::NotRoaming));
    assert!(bearer.capabilities().has(NetCapability::NotCongested));
    assert_eq!(
        bearer.link_properties().tcp_buffer_sizes.as_deref(),
        Some("524288,1048576,2097152,262144,524288,1048576"),
        "LTE buffer defaults expected"
    );

    let completed = done.try_recv().unwrap();
    assert_eq!(completed.cause, FailCause::None);
    assert_eq!(completed.ctx_id, 1);

    assert_eq!(h.agents_created(), 1);
    assert!(h.dispatcher.bearer_by_cid(7).is_some());

    let driver = h.driver.lock().unwrap();
    assert_eq!(driver.state_listeners, vec![id]);
    assert_eq!(driver.call_listeners, vec![id]);
}

// ─── Setup failure with retry hint ──────────────────────────────────────────

#[test]
fn modem_reject_reports_cause_and_retry_hint() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    h.script(SetupScript::Reply(Ok(DataCallResponse {
        cause: 26,
        suggested_retry_ms: 4500,
        ..Default::default()
    })));
    let done = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_inactive());
    assert_eq!(bearer.cid(), -1);
    assert_eq!(bearer.consumer_count(), 0);
    assert_eq!(
        bearer.suggested_retry(),
        Some(RetryHint::After(Duration::from_millis(4500)))
    );
    assert_eq!(bearer.last_fail_cause(), FailCause::Modem(26));

    let completed = done.try_recv().unwrap();
    assert_eq!(completed.cause, FailCause::Modem(26));
    assert_eq!(
        completed.retry_hint,
        Some(RetryHint::After(Duration::from_millis(4500)))
    );

    assert_eq!(h.agents_created(), 0, "no agent for a failed bring-up");
}

// ─── Multi-consumer reference counting ──────────────────────────────────────

#[test]
fn additional_consumer_joins_live_bearer() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    h.script(SetupScript::Reply(Ok(ok_response(7))));
    let _a = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();
    assert!(h.dispatcher.bearer(id).unwrap().is_active());

    let b = bring_up(&h, id, ctx(2, ApnTypes::SUPL, internet_profile()), RequestType::Normal);
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_active(), "no new setup for an additional consumer");
    assert_eq!(bearer.consumer_count(), 2);
    assert!(bearer.capabilities().has(NetCapability::Supl));
    assert_eq!(b.try_recv().unwrap().cause, FailCause::None);
    assert_eq!(h.driver.lock().unwrap().setup_requests.len(), 1);
}

#[test]
fn detached_consumer_disables_its_apn_type_until_reattach() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    h.script(SetupScript::Reply(Ok(ok_response(7))));
    let _a = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    let _b = bring_up(&h, id, ctx(2, ApnTypes::SUPL, internet_profile()), RequestType::Normal);
    h.pump();

    // B leaves; the bearer stays up for A but stops exposing SUPL.
    h.dispatcher.tear_down(id, 2, "supl released", None);
    h.pump();
    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_active());
    assert_eq!(bearer.consumer_count(), 1);
    assert!(!bearer.capabilities().has(NetCapability::Supl));
    assert!(bearer.capabilities().has(NetCapability::Internet));

    // B returns; the bit comes back.
    let b = bring_up(&h, id, ctx(2, ApnTypes::SUPL, internet_profile()), RequestType::Normal);
    h.pump();
    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.capabilities().has(NetCapability::Supl));
    assert_eq!(b.try_recv().unwrap().cause, FailCause::None);
}

#[test]
fn last_consumer_disconnect_tears_down() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    h.script(SetupScript::Reply(Ok(ok_response(7))));
    let _a = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();

    h.driver.lock().unwrap().hold_deactivate = true;
    let (done_tx, done_rx) = unbounded();
    h.dispatcher.tear_down(id, 1, "user requested", Some(done_tx));
    h.pump();
    assert!(h.dispatcher.bearer(id).unwrap().is_disconnecting());

    h.release_deactivate();
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_inactive());
    assert_eq!(bearer.cid(), -1);
    assert_eq!(bearer.consumer_count(), 0);
    assert!(bearer.link_properties().is_empty());
    assert_eq!(done_rx.try_recv().unwrap().reason, "user requested");
    assert!(h.dispatcher.bearer_by_cid(7).is_none());
}

// ─── Staleness ──────────────────────────────────────────────────────────────

#[test]
fn stale_setup_reply_after_reset_is_discarded() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    h.script(SetupScript::Hold);
    let done = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();
    assert!(h.dispatcher.bearer(id).unwrap().is_activating());

    h.dispatcher.reset(id);
    h.pump();
    assert!(h.dispatcher.bearer(id).unwrap().is_inactive());
    assert_eq!(done.try_recv().unwrap().cause, FailCause::LostConnection);

    // The held reply now carries a superseded tag.
    h.release_setup(Ok(ok_response(9)));
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_inactive(), "stale reply must not revive the bearer");
    assert_eq!(bearer.cid(), -1);
    assert_eq!(bearer.stats().stale_replies, 1);
    assert_eq!(h.agents_created(), 0);
}

#[test]
fn reset_from_inactive_is_a_no_op() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);
    let tag_before = h.dispatcher.bearer(id).unwrap().tag();

    h.dispatcher.reset(id);
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_inactive());
    assert_eq!(bearer.tag(), tag_before);
}

// ─── Deferred events ────────────────────────────────────────────────────────

#[test]
fn connect_during_disconnecting_is_deferred_then_served() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    h.script(SetupScript::Reply(Ok(ok_response(7))));
    let _a = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();

    h.driver.lock().unwrap().hold_deactivate = true;
    h.dispatcher.tear_down_all(id, "rebuild", talus_bearer::event::ReleaseType::Normal, None);
    h.pump();
    assert!(h.dispatcher.bearer(id).unwrap().is_disconnecting());

    // Arrives mid-teardown; must not be dropped.
    h.script(SetupScript::Reply(Ok(ok_response(8))));
    let b = bring_up(&h, id, ctx(2, ApnTypes::SUPL, internet_profile()), RequestType::Normal);
    h.pump();
    assert_eq!(b.try_recv().ok(), None, "deferred connect must not resolve yet");

    h.release_deactivate();
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_active(), "deferred connect served after teardown");
    assert_eq!(bearer.cid(), 8);
    assert_eq!(bearer.consumer_count(), 1);
    assert_eq!(b.try_recv().unwrap().cause, FailCause::None);
}

#[test]
fn disconnect_during_activating_is_deferred_then_tears_down() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    h.script(SetupScript::Hold);
    let a = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();
    assert!(h.dispatcher.bearer(id).unwrap().is_activating());

    let (done_tx, done_rx) = unbounded();
    h.dispatcher.tear_down(id, 1, "lost interest", Some(done_tx));
    h.pump();
    assert!(h.dispatcher.bearer(id).unwrap().is_activating(), "disconnect deferred");

    h.release_setup(Ok(ok_response(7)));
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_inactive(), "deferred disconnect ran after activation");
    assert_eq!(a.try_recv().unwrap().cause, FailCause::None, "setup completed first");
    assert_eq!(done_rx.try_recv().unwrap().reason, "lost interest");
}

// ─── Overrides and re-evaluation ────────────────────────────────────────────

#[test]
fn policy_overrides_flow_through_to_the_agent() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    h.script(SetupScript::Reply(Ok(ok_response(7))));
    let _a = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();
    assert!(!h.dispatcher.bearer(id).unwrap().capabilities().has(NetCapability::NotMetered));

    let events = h.dispatcher.sender();
    events.post(id, BearerEvent::UnmeteredOverrideChanged(true));
    h.pump();
    assert!(h.dispatcher.bearer(id).unwrap().capabilities().has(NetCapability::NotMetered));

    events.post(
        id,
        BearerEvent::SubscriptionOverrideChanged {
            mask: SubOverrides::CONGESTED,
            value: SubOverrides::CONGESTED,
        },
    );
    h.pump();
    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(!bearer.capabilities().has(NetCapability::NotCongested));

    let pushed = h.agent(0).last_capabilities().unwrap();
    assert_eq!(&pushed, bearer.capabilities(), "agent saw the refreshed set");
}

#[test]
fn restriction_can_be_lifted_but_is_decided_before_activation() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    let mut restricted_ctx = ctx(1, ApnTypes::DEFAULT, internet_profile());
    restricted_ctx.restricted = true;

    h.script(SetupScript::Reply(Ok(ok_response(7))));
    let _a = bring_up(&h, id, restricted_ctx, RequestType::Normal);
    let _b = bring_up(&h, id, ctx(2, ApnTypes::SUPL, internet_profile()), RequestType::Normal);
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_active());
    assert!(
        !bearer.capabilities().has(NetCapability::NotRestricted),
        "restriction decided on activation"
    );

    // The restricted consumer leaves; re-evaluation may lift (and only
    // lift) the restriction.
    h.dispatcher.tear_down(id, 1, "restricted consumer gone", None);
    h.dispatcher.reevaluate_restricted_state(id);
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_active());
    assert!(bearer.capabilities().has(NetCapability::NotRestricted));
}

#[test]
fn voice_call_suspends_non_concurrent_rat() {
    let mut h = Harness::new();
    let id = h.dispatcher.add_bearer("wwan", Transport::Wwan, 1);
    let events = h.dispatcher.sender();
    events.post(
        id,
        BearerEvent::DataRegChanged(DataRegState {
            rat: RadioTech::OneXRtt,
            in_service: true,
            concurrent_voice_data: false,
            ..Default::default()
        }),
    );
    h.pump();

    h.script(SetupScript::Reply(Ok(ok_response(7))));
    let _a = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();

    events.post(id, BearerEvent::VoiceCallStarted);
    h.pump();
    let infos = h.agent(0).infos();
    assert_eq!(
        infos.last().unwrap().detailed,
        talus_bearer::agent::DetailedState::Suspended
    );

    events.post(id, BearerEvent::VoiceCallEnded);
    h.pump();
    let infos = h.agent(0).infos();
    assert_eq!(
        infos.last().unwrap().detailed,
        talus_bearer::agent::DetailedState::Connected
    );
}

#[test]
fn modem_bandwidth_estimates_update_capabilities() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    h.script(SetupScript::Reply(Ok(ok_response(7))));
    let _a = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();

    h.dispatcher.sender().post(
        id,
        BearerEvent::LinkCapacityChanged { down_kbps: 52000, up_kbps: 21000 },
    );
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert_eq!(bearer.capabilities().link_down_kbps, 52000);
    assert_eq!(bearer.capabilities().link_up_kbps, 21000);
    let pushed = h.agent(0).last_capabilities().unwrap();
    assert_eq!(pushed.link_down_kbps, 52000);
}

// ─── Lost connection ────────────────────────────────────────────────────────

#[test]
fn lost_connection_notifies_consumers_and_releases_agent() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    h.script(SetupScript::Reply(Ok(ok_response(7))));
    let a = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();
    assert_eq!(a.try_recv().unwrap().cause, FailCause::None);

    h.dispatcher.sender().post(id, BearerEvent::LostConnection);
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_inactive());
    assert_eq!(bearer.last_fail_cause(), FailCause::LostConnection);
    assert_eq!(a.try_recv().unwrap().cause, FailCause::LostConnection);

    let calls = h.agent(0).calls();
    let disconnected = h
        .agent(0)
        .infos()
        .iter()
        .any(|i| i.detailed == talus_bearer::agent::DetailedState::Disconnected);
    assert!(disconnected, "agent told the network is gone");
    assert!(calls.iter().any(|c| matches!(c, AgentCall::Release(b) if *b == id)));
}

// ─── Keepalives ─────────────────────────────────────────────────────────────

fn keepalive_packet() -> KeepalivePacket {
    KeepalivePacket {
        src: "10.0.0.2:4500".parse().unwrap(),
        dst: "198.51.100.1:4500".parse().unwrap(),
        payload: vec![0xff],
    }
}

#[test]
fn keepalives_forward_through_the_driver_on_wwan() {
    let mut h = Harness::new();
    let id = add_wwan(&mut h);

    h.script(SetupScript::Reply(Ok(ok_response(7))));
    let _a = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();

    let events = h.dispatcher.sender();
    events.post(
        id,
        BearerEvent::KeepaliveStartRequest {
            slot: 3,
            packet: keepalive_packet(),
            interval: Duration::from_secs(20),
        },
    );
    h.pump();
    assert_eq!(h.driver.lock().unwrap().keepalive_starts, vec![(7, 3)]);

    events.post(
        id,
        BearerEvent::KeepaliveStarted { slot: 3, handle: 42, status: KeepaliveStatus::Success },
    );
    events.post(id, BearerEvent::KeepaliveStopRequest { slot: 3 });
    h.pump();
    assert_eq!(h.driver.lock().unwrap().keepalive_stops, vec![42]);

    events.post(id, BearerEvent::KeepaliveStopped { handle: 42 });
    h.pump();
    let calls = h.agent(0).calls();
    assert!(calls.contains(&AgentCall::Keepalive(3, KeepaliveStatus::Success)));
}

#[test]
fn keepalives_are_rejected_on_wlan() {
    let mut h = Harness::new();
    let id = h.dispatcher.add_bearer("wlan", Transport::Wlan, 1);
    h.dispatcher.sender().post(id, BearerEvent::DataRegChanged(lte_reg()));
    h.pump();

    h.script(SetupScript::Reply(Ok(ok_response(11))));
    let _a = bring_up(&h, id, ctx(1, ApnTypes::IMS, ims_profile()), RequestType::Normal);
    h.pump();
    assert!(h.dispatcher.bearer(id).unwrap().is_active());

    h.dispatcher.sender().post(
        id,
        BearerEvent::KeepaliveStartRequest {
            slot: 5,
            packet: keepalive_packet(),
            interval: Duration::from_secs(20),
        },
    );
    h.pump();

    assert!(h.driver.lock().unwrap().keepalive_starts.is_empty());
    let calls = h.agent(0).calls();
    assert!(calls.contains(&AgentCall::Keepalive(5, KeepaliveStatus::InvalidNetwork)));
}

// ─── Reject retention ───────────────────────────────────────────────────────

#[test]
fn retained_reject_settings_allow_a_retry() {
    let config = talus_bearer::config::PlatformConfig {
        retain_settings_on_reject: true,
        reject_retention_causes: [26].into_iter().collect(),
        ..Default::default()
    };
    let mut h = Harness::with_config(config);
    let id = add_wwan(&mut h);

    h.script(SetupScript::Reply(Ok(DataCallResponse {
        cause: 26,
        suggested_retry_ms: 1000,
        ..Default::default()
    })));
    let a = bring_up(&h, id, ctx(1, ApnTypes::DEFAULT, internet_profile()), RequestType::Normal);
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_inactive());
    assert!(bearer.apn_profile().is_some(), "settings retained for the tracker");
    assert_eq!(a.try_recv().unwrap().cause, FailCause::Modem(26));

    h.script(SetupScript::Reply(Ok(ok_response(7))));
    h.dispatcher.sender().post(id, BearerEvent::RetryConnection);
    h.pump();

    let bearer = h.dispatcher.bearer(id).unwrap();
    assert!(bearer.is_active(), "retry used the saved attempt");
    assert_eq!(bearer.cid(), 7);
    assert_eq!(a.try_recv().unwrap().cause, FailCause::None);
}
