//! Relay Validator - Residential Proxy Checker
//!
//! Validates advertised open proxies in bulk and keeps only live relays whose
//! egress looks residential.
//!
//! ## Features
//!
//! - HTTP and SOCKS5 protocol discovery by racing liveness probes
//! - Origin lookup through the winning tunnel with IP-leak detection
//! - Subnet, ASN and keyword exclusion with a mobile-carrier waiver
//! - Bounded worker pool with a global deadline and graceful shutdown
//! - Streaming and snapshot persistence of accepted relays

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod repository;
pub mod services;

pub use config::Config;
pub use error::{Result, ScanError};
