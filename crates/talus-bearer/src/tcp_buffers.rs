//! Per-RAT TCP buffer sizes.
//!
//! Each value is the six-field kernel string
//! `"rmin,rdef,rmax,wmin,wdef,wmax"`. Selection follows the effective
//! radio, not just the reported one: an LTE anchor with an active NR
//! secondary carrier uses the NR values, LTE with carrier aggregation uses
//! the LTE-CA values, and the EVDO revisions collapse to one entry.
//! Carrier configuration may override any entry by RAT name.

use std::collections::HashMap;

use talus_common::radio::{DataRegState, RadioTech};

const BUFFER_TABLE: &[(&str, &str)] = &[
    ("gprs", "4092,8760,48000,4096,8760,48000"),
    ("edge", "4093,26280,70800,4096,16384,70800"),
    ("umts", "58254,349525,1048576,58254,349525,1048576"),
    ("1xrtt", "16384,32768,131072,4096,16384,102400"),
    ("evdo", "4094,87380,262144,4096,16384,262144"),
    ("ehrpd", "131072,262144,1048576,4096,16384,524288"),
    ("hsdpa", "61167,367002,1101005,8738,52429,262114"),
    ("hspa", "40778,244668,734003,16777,100663,301990"),
    ("hsupa", "40778,244668,734003,16777,100663,301990"),
    ("hspap", "122334,734003,2202010,32040,192239,576717"),
    ("lte", "524288,1048576,2097152,262144,524288,1048576"),
    ("lte_ca", "4096,6291456,12582912,4096,1048576,2097152"),
    ("nr", "2097152,6291456,16777216,512000,2097152,8388608"),
];

/// The table key for the effective radio configuration.
pub fn buffer_key(reg: &DataRegState) -> &'static str {
    if reg.is_nr_nsa() {
        return "nr";
    }
    match reg.rat {
        RadioTech::Evdo0 | RadioTech::EvdoA | RadioTech::EvdoB => "evdo",
        RadioTech::LteCa => "lte_ca",
        RadioTech::Lte if reg.carrier_aggregation => "lte_ca",
        rat => rat.as_str(),
    }
}

fn builtin(key: &str) -> Option<&'static str> {
    BUFFER_TABLE
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
}

/// Resolve the buffer string for the current registration, with carrier
/// overrides taking precedence over the built-in table.
pub fn select(reg: &DataRegState, overrides: &HashMap<String, String>) -> Option<String> {
    let key = buffer_key(reg);
    overrides
        .get(key)
        .cloned()
        .or_else(|| builtin(key).map(str::to_owned))
}
