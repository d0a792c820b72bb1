//! Shared types for the Talus data-connection stack.
//!
//! This crate contains:
//! - **APN model** — APN profiles and the APN type bitmask
//! - **Radio types** — transports, radio access technologies, NR state,
//!   data registration state
//! - **Failure causes** — the failure taxonomy visible to callers, plus
//!   the modem retry-delay decoding
//! - **Handover state** — the per-bearer handover lifecycle enum with its
//!   wire encoding

pub mod apn;
pub mod fail;
pub mod handover;
pub mod radio;
