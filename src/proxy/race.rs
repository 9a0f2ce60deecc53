//! Protocol discovery by racing liveness probes
//!
//! Every plausible protocol for a candidate is probed concurrently; the first
//! acceptable response wins and the remaining probes are dropped, which
//! releases their dialers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::timeout;
use tracing::{debug, instrument};
use url::Url;

use crate::config::ProbeConfig;
use crate::error::{Result, ScanError};
use crate::models::{Endpoint, Protocol};
use crate::proxy::transport::{DialerGuard, HttpResponse, TransportBuilder};

/// Liveness probe settings
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// URL fetched through the candidate
    pub url: Url,
    /// Hard timeout per probe
    pub timeout: Duration,
    /// Bodies shorter than this are treated as fake
    pub min_body_len: usize,
    /// When non-empty, a 403 only counts if its body carries one of these markers
    pub challenge_markers: Vec<String>,
}

impl LivenessConfig {
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            url: config.liveness_url.clone(),
            timeout: config.probe_timeout,
            min_body_len: config.min_body_length,
            challenge_markers: config
                .challenge_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
        }
    }
}

/// A live candidate together with the dialer that reached it
#[derive(Debug)]
pub struct ProbeResult {
    pub endpoint: Endpoint,
    pub protocol: Protocol,
    pub latency_ms: u64,
    pub dialer: DialerGuard,
}

/// Result of probing one protocol
#[derive(Debug)]
pub enum ProbeOutcome {
    Success(ProbeResult),
    Failure { protocol: Protocol, reason: ScanError },
}

/// Races protocols for a candidate
pub struct RaceResolver {
    builder: Arc<dyn TransportBuilder>,
    config: LivenessConfig,
}

impl RaceResolver {
    pub fn new(builder: Arc<dyn TransportBuilder>, config: LivenessConfig) -> Self {
        Self { builder, config }
    }

    /// Decide whether a liveness response proves a working relay
    pub fn assess(&self, protocol: Protocol, response: &HttpResponse) -> Result<()> {
        match response.status {
            200 => {}
            403 => {
                if !self.config.challenge_markers.is_empty() {
                    let body = response.body_text().to_lowercase();
                    if !self
                        .config
                        .challenge_markers
                        .iter()
                        .any(|m| body.contains(m.as_str()))
                    {
                        return Err(ScanError::FakeResponse {
                            protocol,
                            reason: "403 without challenge marker".to_string(),
                        });
                    }
                }
            }
            status => {
                return Err(ScanError::ProbeRefused {
                    protocol,
                    reason: format!("status {}", status),
                })
            }
        }

        if response.body_len() < self.config.min_body_len {
            return Err(ScanError::FakeResponse {
                protocol,
                reason: format!(
                    "body {} bytes below floor {}",
                    response.body_len(),
                    self.config.min_body_len
                ),
            });
        }

        Ok(())
    }

    /// Probe a single protocol
    ///
    /// The dialer is released on every failure path by its guard.
    pub async fn probe(&self, endpoint: &Endpoint, protocol: Protocol) -> ProbeOutcome {
        let dialer = match self.builder.build(endpoint, protocol) {
            Ok(dialer) => DialerGuard::new(protocol, dialer),
            Err(reason) => return ProbeOutcome::Failure { protocol, reason },
        };

        let start = Instant::now();
        let response = match timeout(self.config.timeout, dialer.get(&self.config.url)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return ProbeOutcome::Failure {
                    protocol,
                    reason: ScanError::ProbeRefused {
                        protocol,
                        reason: e.to_string(),
                    },
                }
            }
            Err(_) => {
                return ProbeOutcome::Failure {
                    protocol,
                    reason: ScanError::ProbeTimeout { protocol },
                }
            }
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        if let Err(reason) = self.assess(protocol, &response) {
            return ProbeOutcome::Failure { protocol, reason };
        }

        ProbeOutcome::Success(ProbeResult {
            endpoint: endpoint.clone(),
            protocol,
            latency_ms,
            dialer,
        })
    }

    /// Return the first protocol that proves live
    #[instrument(skip(self), fields(endpoint = %endpoint))]
    pub async fn resolve(&self, endpoint: &Endpoint) -> Result<ProbeResult> {
        let protocols = endpoint.hint().candidates();

        let mut probes: FuturesUnordered<_> = protocols
            .iter()
            .map(|&protocol| self.probe(endpoint, protocol))
            .collect();

        while let Some(outcome) = probes.next().await {
            match outcome {
                ProbeOutcome::Success(result) => {
                    // Dropping the set cancels the losing probes.
                    drop(probes);
                    debug!(
                        protocol = %result.protocol,
                        latency_ms = result.latency_ms,
                        "Probe succeeded"
                    );
                    return Ok(result);
                }
                ProbeOutcome::Failure { protocol, reason } => {
                    debug!(protocol = %protocol, "Probe failed: {}", reason);
                }
            }
        }

        Err(ScanError::NoLiveProtocol {
            attempts: protocols.len(),
        })
    }
}
