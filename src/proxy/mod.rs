//! Relay probing and classification
//!
//! This module provides:
//! - Direct, HTTP CONNECT and SOCKS5 dialing with optional TLS
//! - Dialers with guaranteed release
//! - Protocol racing with liveness checks
//! - Origin lookup and the exclusion filter chain

pub mod classifier;
pub mod dial;
pub mod policy;
pub mod race;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::{LookupConfig, OriginClassifier};
pub use policy::{Decision, FilterPolicy, SubnetRule};
pub use race::{LivenessConfig, ProbeOutcome, ProbeResult, RaceResolver};
pub use transport::{
    Dialer, DialerGuard, HttpResponse, TransportBuilder, TunnelBuilder, TunnelDialer,
};
