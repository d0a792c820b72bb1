//! Link properties and the builder that derives them from a call-setup
//! response.
//!
//! The builder is rule-by-rule validation: a usable interface name, at
//! least one real link address, and a usable DNS list are required;
//! everything else degrades gracefully (MTU falls back through profile and
//! platform defaults, routes tolerate point-to-point gateways). On any
//! error the bearer keeps no partial output.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

use talus_common::apn::{ApnProfile, ApnTypes};
use talus_common::fail::RetryHint;
use talus_common::radio::DataRegState;

use crate::config::PlatformConfig;
use crate::driver::DataCallResponse;
use crate::tcp_buffers;

// ─── Value types ────────────────────────────────────────────────────────────

/// An interface address with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAddress {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl LinkAddress {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        LinkAddress { addr, prefix_len }
    }

    /// An all-zeros address the modem sometimes reports as a placeholder.
    pub fn is_any_local(&self) -> bool {
        self.addr.is_unspecified()
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// One route derived from a modem-reported gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteInfo {
    /// `None` is a point-to-point route (the modem reported a zero
    /// gateway).
    pub gateway: Option<IpAddr>,
}

/// HTTP proxy exposed on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProxy {
    pub host: String,
    pub port: u16,
}

/// Everything the OS connectivity layer needs to use the link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkProperties {
    pub interface_name: String,
    pub addresses: Vec<LinkAddress>,
    pub dns: Vec<IpAddr>,
    pub pcscf: Vec<IpAddr>,
    pub routes: Vec<RouteInfo>,
    pub mtu: Option<u32>,
    /// "rmin,rdef,rmax,wmin,wdef,wmax", per the current RAT.
    pub tcp_buffer_sizes: Option<String>,
    pub http_proxy: Option<HttpProxy>,
}

impl LinkProperties {
    pub fn is_empty(&self) -> bool {
        self.interface_name.is_empty() && self.addresses.is_empty()
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

/// Why a setup response could not be turned into link properties.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The response is structurally unusable; the call must be torn down.
    #[error("invalid setup response: {0}")]
    InvalidArg(&'static str),
    /// The modem rejected the call with a specific cause.
    #[error("modem cause {cause}")]
    Modem { cause: i32, retry: RetryHint },
}

/// Build validated link properties from a successful setup response.
///
/// `prev` carries the bearer's previous link properties so the HTTP proxy
/// survives re-derivation; on a fresh bring-up the proxy comes from the
/// APN profile instead.
pub fn build_link_properties(
    resp: &DataCallResponse,
    profile: &ApnProfile,
    reg: &DataRegState,
    config: &PlatformConfig,
    prev: Option<&LinkProperties>,
) -> Result<LinkProperties, LinkError> {
    if resp.cause != 0 {
        return Err(LinkError::Modem {
            cause: resp.cause,
            retry: RetryHint::decode(resp.suggested_retry_ms),
        });
    }

    if resp.interface_name.is_empty() {
        return Err(LinkError::InvalidArg("empty interface name"));
    }

    let addresses: Vec<LinkAddress> = resp.addresses.clone();
    if !addresses.iter().any(|a| !a.is_any_local()) {
        return Err(LinkError::InvalidArg("no usable link address"));
    }

    let dns = usable_dns(resp, profile, config)?;

    let routes = resp
        .gateways
        .iter()
        .map(|gw| RouteInfo {
            gateway: (!gw.is_unspecified()).then_some(*gw),
        })
        .collect();

    let mtu = if resp.mtu > 0 {
        Some(resp.mtu)
    } else if profile.mtu > 0 {
        Some(profile.mtu)
    } else if config.default_mtu > 0 {
        Some(config.default_mtu)
    } else {
        None
    };

    let http_proxy = prev
        .and_then(|p| p.http_proxy.clone())
        .or_else(|| profile_proxy(profile));

    Ok(LinkProperties {
        interface_name: resp.interface_name.clone(),
        addresses,
        dns,
        pcscf: resp.pcscf.clone(),
        routes,
        mtu,
        tcp_buffer_sizes: tcp_buffers::select(reg, &config.tcp_buffer_overrides),
        http_proxy,
    })
}

fn profile_proxy(profile: &ApnProfile) -> Option<HttpProxy> {
    let host = profile.proxy.clone()?;
    if host.is_empty() {
        return None;
    }
    Some(HttpProxy {
        host,
        port: profile.proxy_port.unwrap_or(80),
    })
}

/// Pick the DNS server list: modem-provided addresses win; the system
/// fallback pair is only usable when it passes the DNS-ok check.
///
/// Both fallback addresses being unspecified means no DNS is configured
/// yet — except for an MMS APN whose MMSC proxy is an IP literal, where no
/// resolution is needed and an empty list is acceptable.
fn usable_dns(
    resp: &DataCallResponse,
    profile: &ApnProfile,
    config: &PlatformConfig,
) -> Result<Vec<IpAddr>, LinkError> {
    let from_modem: Vec<IpAddr> = resp
        .dns
        .iter()
        .copied()
        .filter(|d| !d.is_unspecified())
        .collect();
    if !from_modem.is_empty() {
        return Ok(from_modem);
    }

    let fallback_unusable = config.fallback_dns.iter().all(|d| d.is_unspecified());
    let mms_exception =
        profile.types.contains(ApnTypes::MMS) && profile.mms_proxy_is_ip_literal();
    if fallback_unusable && !mms_exception {
        return Err(LinkError::InvalidArg("no usable dns address"));
    }

    Ok(config
        .fallback_dns
        .iter()
        .copied()
        .filter(|d| !d.is_unspecified())
        .collect())
}
