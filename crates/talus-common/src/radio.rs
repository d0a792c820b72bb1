//! Radio transports, access technologies, and registration state.

use std::fmt;

// ─── Transport ──────────────────────────────────────────────────────────────

/// The radio transport a bearer is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Cellular wide-area radio.
    Wwan,
    /// Cellular-over-Wi-Fi (e.g. ePDG tunnel).
    Wlan,
}

impl Transport {
    /// The handover counterpart of this transport.
    pub fn opposite(self) -> Transport {
        match self {
            Transport::Wwan => Transport::Wlan,
            Transport::Wlan => Transport::Wwan,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Wwan => "wwan",
            Transport::Wlan => "wlan",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Radio Access Technology ────────────────────────────────────────────────

/// Radio access technology reported by the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RadioTech {
    #[default]
    Unknown,
    Gprs,
    Edge,
    Umts,
    OneXRtt,
    Evdo0,
    EvdoA,
    EvdoB,
    Ehrpd,
    Hsdpa,
    Hsupa,
    Hspa,
    Hspap,
    Lte,
    LteCa,
    Nr,
}

impl RadioTech {
    /// Canonical lowercase name, used as the key into per-RAT tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            RadioTech::Unknown => "unknown",
            RadioTech::Gprs => "gprs",
            RadioTech::Edge => "edge",
            RadioTech::Umts => "umts",
            RadioTech::OneXRtt => "1xrtt",
            RadioTech::Evdo0 => "evdo_0",
            RadioTech::EvdoA => "evdo_a",
            RadioTech::EvdoB => "evdo_b",
            RadioTech::Ehrpd => "ehrpd",
            RadioTech::Hsdpa => "hsdpa",
            RadioTech::Hsupa => "hsupa",
            RadioTech::Hspa => "hspa",
            RadioTech::Hspap => "hspap",
            RadioTech::Lte => "lte",
            RadioTech::LteCa => "lte_ca",
            RadioTech::Nr => "nr",
        }
    }

    /// Whether this is an LTE-family technology (eligible for NR-NSA
    /// anchoring).
    pub fn is_lte(&self) -> bool {
        matches!(self, RadioTech::Lte | RadioTech::LteCa)
    }
}

impl fmt::Display for RadioTech {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── NR state ───────────────────────────────────────────────────────────────

/// 5G NR availability on the current cell, as reported alongside an LTE
/// anchor (non-standalone mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NrState {
    /// No NR coverage advertised.
    #[default]
    None,
    /// NR advertised but restricted for this subscription.
    Restricted,
    /// NR advertised and usable, secondary cell not yet active.
    NotRestricted,
    /// NR secondary cell active — traffic is flowing over NR.
    Connected,
}

impl NrState {
    pub fn is_connected(&self) -> bool {
        matches!(self, NrState::Connected)
    }
}

/// Frequency range of the active NR carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NrFrequency {
    #[default]
    Low,
    Mid,
    High,
    Mmwave,
}

// ─── Data registration state ────────────────────────────────────────────────

/// Snapshot of the packet-data registration state, pushed by the radio
/// driver whenever registration or the serving RAT changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRegState {
    /// Serving radio technology.
    pub rat: RadioTech,
    /// Whether packet data is in service at all.
    pub in_service: bool,
    /// Whether the serving network reports data roaming.
    pub roaming: bool,
    /// Whether the serving network allows concurrent voice and data.
    pub concurrent_voice_data: bool,
    /// NR availability (meaningful when `rat` is LTE-family).
    pub nr_state: NrState,
    /// Frequency range of the NR carrier, when connected.
    pub nr_frequency: NrFrequency,
    /// Whether carrier aggregation is active on the serving cell.
    pub carrier_aggregation: bool,
}

impl Default for DataRegState {
    fn default() -> Self {
        DataRegState {
            rat: RadioTech::Unknown,
            in_service: false,
            roaming: false,
            concurrent_voice_data: true,
            nr_state: NrState::None,
            nr_frequency: NrFrequency::Low,
            carrier_aggregation: false,
        }
    }
}

impl DataRegState {
    /// Whether the bearer rides an NR secondary carrier while anchored on
    /// LTE (5G non-standalone).
    pub fn is_nr_nsa(&self) -> bool {
        self.rat.is_lte() && self.nr_state.is_connected()
    }
}
