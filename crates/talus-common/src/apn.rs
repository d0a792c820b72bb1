//! APN profiles and the APN type bitmask.

use std::fmt;

// ─── APN type bitmask ───────────────────────────────────────────────────────

/// Bitmask of APN types a profile can serve (or a consumer can request).
///
/// A profile configured with [`ApnTypes::ALL`] serves every non-emergency
/// type. Individual consumers normally request a single bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ApnTypes(u32);

impl ApnTypes {
    pub const NONE: ApnTypes = ApnTypes(0);
    pub const DEFAULT: ApnTypes = ApnTypes(1 << 0);
    pub const MMS: ApnTypes = ApnTypes(1 << 1);
    pub const SUPL: ApnTypes = ApnTypes(1 << 2);
    pub const DUN: ApnTypes = ApnTypes(1 << 3);
    pub const FOTA: ApnTypes = ApnTypes(1 << 4);
    pub const IMS: ApnTypes = ApnTypes(1 << 5);
    pub const CBS: ApnTypes = ApnTypes(1 << 6);
    pub const IA: ApnTypes = ApnTypes(1 << 7);
    pub const EMERGENCY: ApnTypes = ApnTypes(1 << 8);
    pub const MCX: ApnTypes = ApnTypes(1 << 9);

    /// Every type a `*`-configured profile serves. Emergency and MCX
    /// profiles are always provisioned explicitly.
    pub const ALL: ApnTypes = ApnTypes(
        Self::DEFAULT.0
            | Self::MMS.0
            | Self::SUPL.0
            | Self::DUN.0
            | Self::FOTA.0
            | Self::IMS.0
            | Self::CBS.0
            | Self::IA.0,
    );

    const NAMED: &'static [(ApnTypes, &'static str)] = &[
        (Self::DEFAULT, "default"),
        (Self::MMS, "mms"),
        (Self::SUPL, "supl"),
        (Self::DUN, "dun"),
        (Self::FOTA, "fota"),
        (Self::IMS, "ims"),
        (Self::CBS, "cbs"),
        (Self::IA, "ia"),
        (Self::EMERGENCY, "emergency"),
        (Self::MCX, "mcx"),
    ];

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is present in `self`.
    pub fn contains(self, other: ApnTypes) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when `self` and `other` share at least one bit.
    pub fn intersects(self, other: ApnTypes) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: ApnTypes) -> ApnTypes {
        ApnTypes(self.0 | other.0)
    }

    pub fn difference(self, other: ApnTypes) -> ApnTypes {
        ApnTypes(self.0 & !other.0)
    }

    pub fn insert(&mut self, other: ApnTypes) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ApnTypes) {
        self.0 &= !other.0;
    }

    /// Parse a single lowercase type name ("default", "mms", … or "*").
    pub fn from_name(name: &str) -> Option<ApnTypes> {
        if name == "*" {
            return Some(Self::ALL);
        }
        Self::NAMED
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(t, _)| *t)
    }

    /// Iterate the named bits present in this mask.
    pub fn iter_names(self) -> impl Iterator<Item = (ApnTypes, &'static str)> {
        Self::NAMED
            .iter()
            .copied()
            .filter(move |(t, _)| self.contains(*t))
    }
}

impl fmt::Display for ApnTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (_, name) in self.iter_names() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

// ─── Protocol / auth ────────────────────────────────────────────────────────

/// PDP protocol type of an APN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PdpProtocol {
    Ip,
    Ipv6,
    #[default]
    Ipv4v6,
}

impl PdpProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            PdpProtocol::Ip => "IP",
            PdpProtocol::Ipv6 => "IPV6",
            PdpProtocol::Ipv4v6 => "IPV4V6",
        }
    }
}

/// APN authentication scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    None,
    Pap,
    Chap,
    PapChap,
}

// ─── APN profile ────────────────────────────────────────────────────────────

/// One provisioned APN configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApnProfile {
    /// Operator-visible entry name ("Internet", "IMS", …).
    pub entry_name: String,
    /// The access point name sent to the network.
    pub apn: String,
    /// HTTP proxy host, if the profile configures one.
    pub proxy: Option<String>,
    pub proxy_port: Option<u16>,
    /// MMSC proxy, relevant to the MMS DNS fallback exception.
    pub mms_proxy: Option<String>,
    /// Types this profile serves.
    pub types: ApnTypes,
    pub protocol: PdpProtocol,
    pub auth: AuthType,
    /// Profile-configured MTU; 0 means unset.
    pub mtu: u32,
    /// Modem profile id used in setup requests.
    pub profile_id: u32,
}

impl ApnProfile {
    /// Whether this profile can serve a consumer requesting `types`.
    pub fn can_serve(&self, types: ApnTypes) -> bool {
        self.types.contains(types)
    }

    /// Whether usage of this profile counts against the metered quota,
    /// given the carrier's metered type set.
    pub fn is_metered(&self, metered_types: ApnTypes) -> bool {
        self.types.intersects(metered_types)
    }

    /// Whether the MMS proxy is a literal IP address (rather than a
    /// hostname needing resolution).
    pub fn mms_proxy_is_ip_literal(&self) -> bool {
        self.mms_proxy
            .as_deref()
            .is_some_and(|p| p.parse::<std::net::IpAddr>().is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn internet_profile() -> ApnProfile {
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
            profile_id: 0,
        }
    }

    #[test]
    fn all_covers_every_non_emergency_type() {
        assert!(ApnTypes::ALL.contains(ApnTypes::DEFAULT));
        assert!(ApnTypes::ALL.contains(ApnTypes::IMS));
        assert!(!ApnTypes::ALL.contains(ApnTypes::EMERGENCY));
        assert!(!ApnTypes::ALL.contains(ApnTypes::MCX));
    }

    #[test]
    fn profile_serves_subset_of_its_types() {
        let profile = internet_profile();
        assert!(profile.can_serve(ApnTypes::DEFAULT));
        assert!(profile.can_serve(ApnTypes::SUPL));
        assert!(!profile.can_serve(ApnTypes::MMS));
        assert!(!profile.can_serve(ApnTypes::DEFAULT.union(ApnTypes::MMS)));
    }

    #[test]
    fn meteredness_is_an_intersection_test() {
        let profile = internet_profile();
        assert!(profile.is_metered(ApnTypes::DEFAULT.union(ApnTypes::MMS)));
        assert!(!profile.is_metered(ApnTypes::MMS.union(ApnTypes::DUN)));
    }

    #[test]
    fn parse_names_and_star() {
        assert_eq!(ApnTypes::from_name("mms"), Some(ApnTypes::MMS));
        assert_eq!(ApnTypes::from_name("*"), Some(ApnTypes::ALL));
        assert_eq!(ApnTypes::from_name("bogus"), None);
    }

    #[test]
    fn display_joins_names() {
        let t = ApnTypes::DEFAULT.union(ApnTypes::IMS);
        assert_eq!(t.to_string(), "default|ims");
        assert_eq!(ApnTypes::NONE.to_string(), "none");
    }

    #[test]
    fn mms_proxy_literal_detection() {
        let mut profile = internet_profile();
        assert!(!profile.mms_proxy_is_ip_literal());
        profile.mms_proxy = Some("mmsproxy.example.com".into());
        assert!(!profile.mms_proxy_is_ip_literal());
        profile.mms_proxy = Some("10.1.2.3".into());
        assert!(profile.mms_proxy_is_ip_literal());
    }
}
