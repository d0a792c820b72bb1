//! Network-capability synthesis.
//!
//! Capabilities are derived, never stored authoritative state: the APN
//! type bitmask (minus per-consumer disabled bits) yields the service
//! capabilities, policy overrides and the registration snapshot yield the
//! metered/restricted/roaming/congested flags, and a per-RAT table yields
//! the advertised bandwidths. Synthesis is a pure function of its inputs,
//! so re-running it on unchanged state produces an equal set.
//!
//! One direction is load-bearing: the upstream agent contract forbids
//! taking restrictions *back*. A bearer must be exposed restricted from
//! its very first capability set if it may ever need to be, and may only
//! move restricted → unrestricted later.

use std::collections::BTreeSet;
use std::fmt;

use talus_common::apn::{ApnProfile, ApnTypes};
use talus_common::radio::DataRegState;

use crate::config::PlatformConfig;
use crate::event::ApnContext;

// ─── Capability set ─────────────────────────────────────────────────────────

/// One capability bit exposed to the connectivity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetCapability {
    TransportCellular,
    Internet,
    Mms,
    Supl,
    Dun,
    Fota,
    Ims,
    Cbs,
    Ia,
    Eims,
    Mcx,
    NotMetered,
    NotRestricted,
    NotRoaming,
    NotCongested,
}

/// Capabilities that keep a network out of the restricted pool.
const UNRESTRICTED_CAPS: &[NetCapability] =
    &[NetCapability::Internet, NetCapability::Mms, NetCapability::Supl];

/// Service capabilities that mark a network restricted when nothing from
/// `UNRESTRICTED_CAPS` accompanies them.
const RESTRICTED_CAPS: &[NetCapability] = &[
    NetCapability::Cbs,
    NetCapability::Dun,
    NetCapability::Eims,
    NetCapability::Fota,
    NetCapability::Ia,
    NetCapability::Ims,
    NetCapability::Mcx,
];

/// The full capability value pushed to the upstream agent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetCapabilities {
    caps: BTreeSet<NetCapability>,
    /// Network specifier: the subscription this network belongs to.
    pub specifier: Option<i32>,
    pub link_down_kbps: u32,
    pub link_up_kbps: u32,
}

impl NetCapabilities {
    pub fn has(&self, cap: NetCapability) -> bool {
        self.caps.contains(&cap)
    }

    pub fn insert(&mut self, cap: NetCapability) {
        self.caps.insert(cap);
    }

    pub fn remove(&mut self, cap: NetCapability) {
        self.caps.remove(&cap);
    }

    pub fn iter(&self) -> impl Iterator<Item = NetCapability> + '_ {
        self.caps.iter().copied()
    }
}

impl fmt::Display for NetCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "caps={:?} specifier={:?} bw={}↓/{}↑kbps",
            self.caps, self.specifier, self.link_down_kbps, self.link_up_kbps
        )
    }
}

// ─── Overrides ──────────────────────────────────────────────────────────────

/// Subscription-plan override bits, applied with a mask/value pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubOverrides(u32);

impl SubOverrides {
    pub const UNMETERED: SubOverrides = SubOverrides(1 << 0);
    pub const CONGESTED: SubOverrides = SubOverrides(1 << 1);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: SubOverrides) -> bool {
        self.0 & other.0 == other.0
    }

    /// Replace the masked bits with `value`, leaving the rest untouched.
    pub fn apply(self, mask: SubOverrides, value: SubOverrides) -> SubOverrides {
        SubOverrides((self.0 & !mask.0) | (value.0 & mask.0))
    }

    pub fn union(self, other: SubOverrides) -> SubOverrides {
        SubOverrides(self.0 | other.0)
    }
}

/// External policy inputs that modify the exposed capabilities without
/// changing the underlying bearer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Policy manager says this subscription is currently unmetered.
    pub unmetered: bool,
    pub subscription: SubOverrides,
    /// Evaluated before the agent exists; may only be cleared afterwards.
    pub restricted: bool,
    /// Only unmetered-eligible consumers may use this bearer.
    pub unmetered_use_only: bool,
}

// ─── Bandwidth table ────────────────────────────────────────────────────────

/// Built-in (downstream, upstream) kbps estimates by RAT table key.
const BANDWIDTH_TABLE: &[(&str, (u32, u32))] = &[
    ("gprs", (24, 24)),
    ("edge", (236, 118)),
    ("umts", (115, 115)),
    ("1xrtt", (30, 30)),
    ("evdo_0", (2457, 154)),
    ("evdo_a", (3100, 1800)),
    ("evdo_b", (14700, 1800)),
    ("ehrpd", (21600, 5400)),
    ("hsdpa", (14400, 384)),
    ("hsupa", (14400, 5760)),
    ("hspa", (14400, 5760)),
    ("hspap", (42200, 5760)),
    ("lte", (30000, 15000)),
    ("lte_ca", (60000, 30000)),
    ("nr_nsa", (47000, 18000)),
    ("nr_nsa_mmwave", (145000, 60000)),
    ("nr", (145000, 60000)),
];

/// Bandwidth used when a RAT has no table entry at all.
pub const BANDWIDTH_FLOOR_KBPS: (u32, u32) = (14, 14);

pub(crate) fn builtin_bandwidth(key: &str) -> Option<(u32, u32)> {
    BANDWIDTH_TABLE
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
}

/// The bandwidth table key for the effective radio configuration. An LTE
/// anchor with a connected NR carrier advertises the NSA figures, split by
/// frequency range.
pub fn bandwidth_key(reg: &DataRegState) -> &'static str {
    use talus_common::radio::NrFrequency;
    if reg.is_nr_nsa() {
        if reg.nr_frequency == NrFrequency::Mmwave {
            "nr_nsa_mmwave"
        } else {
            "nr_nsa"
        }
    } else {
        reg.rat.as_str()
    }
}

// ─── Scores ─────────────────────────────────────────────────────────────────

/// Score for a bearer serving an unconstrained internet request.
pub const SCORE_INTERNET: u8 = 50;
/// Score for every other bearer.
pub const SCORE_OTHER: u8 = 45;

/// 50 when some attached consumer requests internet service with no
/// network-specifier constraint, 45 otherwise.
pub fn score<'a>(mut consumers: impl Iterator<Item = &'a ApnContext>) -> u8 {
    let unconstrained_internet = consumers
        .any(|ctx| ctx.apn_type.contains(ApnTypes::DEFAULT) && ctx.specifier.is_none());
    if unconstrained_internet {
        SCORE_INTERNET
    } else {
        SCORE_OTHER
    }
}

// ─── Suspend rule ───────────────────────────────────────────────────────────

/// Whether the bearer should report SUSPENDED rather than CONNECTED.
pub fn suspended(reg: &DataRegState, voice_call_active: bool) -> bool {
    !reg.in_service || (!reg.concurrent_voice_data && voice_call_active)
}

// ─── Synthesis ──────────────────────────────────────────────────────────────

/// Inputs to one synthesis pass.
pub struct CapsContext<'a> {
    pub profile: &'a ApnProfile,
    /// Types whose consumers have detached; their capabilities are hidden
    /// until a consumer re-attaches.
    pub disabled_types: ApnTypes,
    pub overrides: &'a Overrides,
    pub reg: &'a DataRegState,
    pub sub_id: i32,
    pub config: &'a PlatformConfig,
}

/// Derive the exposed capability set. Pure: equal inputs give equal sets.
pub fn synthesize(ctx: &CapsContext<'_>) -> NetCapabilities {
    let mut nc = NetCapabilities {
        specifier: Some(ctx.sub_id),
        ..Default::default()
    };
    nc.insert(NetCapability::TransportCellular);

    let types = ctx.profile.types.difference(ctx.disabled_types);
    for (apn_type, cap) in [
        (ApnTypes::DEFAULT, NetCapability::Internet),
        (ApnTypes::MMS, NetCapability::Mms),
        (ApnTypes::SUPL, NetCapability::Supl),
        (ApnTypes::DUN, NetCapability::Dun),
        (ApnTypes::FOTA, NetCapability::Fota),
        (ApnTypes::IMS, NetCapability::Ims),
        (ApnTypes::CBS, NetCapability::Cbs),
        (ApnTypes::IA, NetCapability::Ia),
        (ApnTypes::EMERGENCY, NetCapability::Eims),
        (ApnTypes::MCX, NetCapability::Mcx),
    ] {
        if types.contains(apn_type) {
            nc.insert(cap);
        }
    }

    let apn_metered = ctx.profile.is_metered(ctx.config.metered_types);
    let mut not_metered = (ctx.overrides.unmetered_use_only && !ctx.overrides.restricted)
        || !apn_metered;
    if ctx.overrides.unmetered || ctx.overrides.subscription.contains(SubOverrides::UNMETERED) {
        not_metered = true;
    }
    if not_metered {
        nc.insert(NetCapability::NotMetered);
    }

    if ctx.overrides.restricted {
        nc.remove(NetCapability::Dun);
    } else if !only_restricted_services(&nc) {
        nc.insert(NetCapability::NotRestricted);
    }

    if !ctx.reg.roaming {
        nc.insert(NetCapability::NotRoaming);
    }

    if !ctx.overrides.subscription.contains(SubOverrides::CONGESTED) {
        nc.insert(NetCapability::NotCongested);
    }

    let (down, up) = ctx.config.bandwidth_for(bandwidth_key(ctx.reg));
    nc.link_down_kbps = down;
    nc.link_up_kbps = up;

    nc
}

fn only_restricted_services(nc: &NetCapabilities) -> bool {
    RESTRICTED_CAPS.iter().any(|c| nc.has(*c))
        && !UNRESTRICTED_CAPS.iter().any(|c| nc.has(*c))
}
