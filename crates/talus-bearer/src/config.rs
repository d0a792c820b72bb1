//! Platform and carrier configuration.
//!
//! Raw configuration deserializes into [`PlatformConfigInput`] (every
//! field optional) and resolves into [`PlatformConfig`] with documented
//! defaults. Malformed carrier override entries are logged and skipped
//! rather than failing the whole load.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};

use serde::Deserialize;
use tracing::warn;

use talus_common::apn::ApnTypes;

use crate::caps;

/// Where advertised bandwidth figures come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandwidthSource {
    /// Modem link-capacity estimates update the exposed bandwidths.
    #[default]
    Modem,
    /// Only the per-RAT carrier table is used.
    Carrier,
}

/// Raw deserialized configuration; all fields optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlatformConfigInput {
    /// Fallback MTU when neither the modem nor the APN reports one.
    pub default_mtu: Option<u32>,
    /// System fallback DNS pair, used when the modem reports none.
    pub fallback_dns: Option<[String; 2]>,
    /// Entries of the form "ratname:rmin,rdef,rmax,wmin,wdef,wmax".
    pub tcp_buffer_overrides: Option<Vec<String>>,
    /// Entries of the form "ratname:down_kbps,up_kbps".
    pub bandwidth_overrides: Option<Vec<String>>,
    pub bandwidth_source: Option<BandwidthSource>,
    /// APN type names counting against the metered quota.
    pub metered_apn_types: Option<Vec<String>>,
    /// Keep the failed APN settings visible in Inactive when the modem
    /// cause is one of `reject_retention_causes`.
    pub retain_settings_on_reject: Option<bool>,
    pub reject_retention_causes: Option<Vec<i32>>,
}

/// Resolved configuration shared by all bearers on a dispatcher.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// 0 means no platform MTU fallback.
    pub default_mtu: u32,
    pub fallback_dns: [IpAddr; 2],
    pub tcp_buffer_overrides: HashMap<String, String>,
    pub bandwidth_overrides: HashMap<String, (u32, u32)>,
    pub bandwidth_source: BandwidthSource,
    pub metered_types: ApnTypes,
    pub retain_settings_on_reject: bool,
    pub reject_retention_causes: HashSet<i32>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            default_mtu: 0,
            fallback_dns: [
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ],
            tcp_buffer_overrides: HashMap::new(),
            bandwidth_overrides: HashMap::new(),
            bandwidth_source: BandwidthSource::default(),
            metered_types: ApnTypes::DEFAULT
                .union(ApnTypes::MMS)
                .union(ApnTypes::SUPL)
                .union(ApnTypes::DUN),
            retain_settings_on_reject: false,
            reject_retention_causes: HashSet::new(),
        }
    }
}

impl PlatformConfig {
    /// Resolve raw input against the defaults.
    pub fn resolve(input: PlatformConfigInput) -> PlatformConfig {
        let mut config = PlatformConfig::default();

        if let Some(mtu) = input.default_mtu {
            config.default_mtu = mtu;
        }

        if let Some(dns) = input.fallback_dns {
            for (slot, raw) in dns.iter().enumerate() {
                match raw.parse() {
                    Ok(addr) => config.fallback_dns[slot] = addr,
                    Err(_) => warn!(entry = %raw, "bad fallback dns address, ignored"),
                }
            }
        }

        for entry in input.tcp_buffer_overrides.unwrap_or_default() {
            match parse_tcp_buffer_override(&entry) {
                Some((rat, sizes)) => {
                    config.tcp_buffer_overrides.insert(rat, sizes);
                }
                None => warn!(entry = %entry, "bad tcp buffer override, ignored"),
            }
        }

        for entry in input.bandwidth_overrides.unwrap_or_default() {
            match parse_bandwidth_override(&entry) {
                Some((rat, pair)) => {
                    config.bandwidth_overrides.insert(rat, pair);
                }
                None => warn!(entry = %entry, "bad bandwidth override, ignored"),
            }
        }

        if let Some(source) = input.bandwidth_source {
            config.bandwidth_source = source;
        }

        if let Some(names) = input.metered_apn_types {
            let mut metered = ApnTypes::NONE;
            for name in &names {
                match ApnTypes::from_name(name) {
                    Some(t) => metered.insert(t),
                    None => warn!(entry = %name, "unknown metered apn type, ignored"),
                }
            }
            config.metered_types = metered;
        }

        if let Some(retain) = input.retain_settings_on_reject {
            config.retain_settings_on_reject = retain;
        }
        if let Some(causes) = input.reject_retention_causes {
            config.reject_retention_causes = causes.into_iter().collect();
        }

        config
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<PlatformConfig> {
        let input: PlatformConfigInput = toml::from_str(raw)?;
        Ok(PlatformConfig::resolve(input))
    }

    /// Advertised (downstream, upstream) kbps for a bandwidth table key.
    pub fn bandwidth_for(&self, key: &str) -> (u32, u32) {
        self.bandwidth_overrides
            .get(key)
            .copied()
            .or_else(|| caps::builtin_bandwidth(key))
            .unwrap_or(caps::BANDWIDTH_FLOOR_KBPS)
    }

    /// Whether a modem reject cause qualifies for settings retention.
    pub fn retains_on_reject(&self, cause: i32) -> bool {
        self.retain_settings_on_reject && self.reject_retention_causes.contains(&cause)
    }
}

/// "ratname:r,r,r,w,w,w" → (ratname, "r,r,r,w,w,w")
fn parse_tcp_buffer_override(entry: &str) -> Option<(String, String)> {
    let (rat, sizes) = entry.split_once(':')?;
    if rat.is_empty() {
        return None;
    }
    let fields: Vec<&str> = sizes.split(',').collect();
    if fields.len() != 6 || fields.iter().any(|f| f.parse::<u32>().is_err()) {
        return None;
    }
    Some((rat.to_owned(), sizes.to_owned()))
}

/// "ratname:down,up" → (ratname, (down, up))
fn parse_bandwidth_override(entry: &str) -> Option<(String, (u32, u32))> {
    let (rat, pair) = entry.split_once(':')?;
    if rat.is_empty() {
        return None;
    }
    let (down, up) = pair.split_once(',')?;
    Some((rat.to_owned(), (down.parse().ok()?, up.parse().ok()?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = PlatformConfig::default();
        assert_eq!(config.default_mtu, 0);
        assert!(config.fallback_dns.iter().all(|d| d.is_unspecified()));
        assert!(config.metered_types.contains(ApnTypes::DEFAULT));
        assert!(!config.metered_types.contains(ApnTypes::IMS));
        assert!(!config.retains_on_reject(29));
    }

    #[test]
    fn toml_round_trip() {
        let config = PlatformConfig::from_toml_str(
            r#"
            default_mtu = 1400
            fallback_dns = ["8.8.8.8", "8.8.4.4"]
            tcp_buffer_overrides = ["lte:1,2,3,4,5,6"]
            bandwidth_overrides = ["lte:50000,20000"]
            bandwidth_source = "carrier"
            metered_apn_types = ["default", "dun"]
            retain_settings_on_reject = true
            reject_retention_causes = [29, 33]
            "#,
        )
        .unwrap();

        assert_eq!(config.default_mtu, 1400);
        assert_eq!(config.fallback_dns[0].to_string(), "8.8.8.8");
        assert_eq!(config.tcp_buffer_overrides["lte"], "1,2,3,4,5,6");
        assert_eq!(config.bandwidth_for("lte"), (50000, 20000));
        assert_eq!(config.bandwidth_source, BandwidthSource::Carrier);
        assert!(!config.metered_types.contains(ApnTypes::MMS));
        assert!(config.retains_on_reject(33));
        assert!(!config.retains_on_reject(26));
    }

    #[test]
    fn malformed_overrides_are_skipped() {
        let input = PlatformConfigInput {
            tcp_buffer_overrides: Some(vec![
                "lte:1,2,3,4,5".into(),      // five fields
                "lte:1,2,3,4,5,x".into(),    // non-numeric
                "nolon".into(),              // no separator
                "nr:9,8,7,6,5,4".into(),     // good
            ]),
            bandwidth_overrides: Some(vec!["lte:abc,1".into(), "nr:1000,500".into()]),
            ..Default::default()
        };
        let config = PlatformConfig::resolve(input);
        assert_eq!(config.tcp_buffer_overrides.len(), 1);
        assert_eq!(config.tcp_buffer_overrides["nr"], "9,8,7,6,5,4");
        assert_eq!(config.bandwidth_overrides.len(), 1);
    }

    #[test]
    fn unknown_bandwidth_key_hits_floor() {
        let config = PlatformConfig::default();
        assert_eq!(config.bandwidth_for("unknown"), caps::BANDWIDTH_FLOOR_KBPS);
        assert_ne!(config.bandwidth_for("lte"), caps::BANDWIDTH_FLOOR_KBPS);
    }
}
