//! Origin classification through the winning dialer

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, instrument};
use url::Url;

use crate::config::ProbeConfig;
use crate::error::{Result, ScanError};
use crate::models::{Endpoint, OriginInfo, Verdict};
use crate::proxy::policy::{Decision, FilterPolicy};
use crate::proxy::race::ProbeResult;

/// Origin lookup settings
#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub url: Url,
    pub timeout: Duration,
}

impl LookupConfig {
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            url: config.origin_lookup_url.clone(),
            timeout: config.lookup_timeout,
        }
    }
}

/// Looks up where a live candidate egresses from and applies the filter chain
pub struct OriginClassifier {
    policy: FilterPolicy,
    config: LookupConfig,
}

impl OriginClassifier {
    pub fn new(policy: FilterPolicy, config: LookupConfig) -> Self {
        Self { policy, config }
    }

    /// Classify a live candidate, consuming its dialer
    ///
    /// Lookup failures are fail-closed errors; policy rejections come back as
    /// a `Verdict` with `accepted == false`.
    #[instrument(skip(self, probe), fields(endpoint = %probe.endpoint, protocol = %probe.protocol))]
    pub async fn classify(&self, probe: ProbeResult) -> Result<Verdict> {
        let ProbeResult {
            endpoint,
            protocol,
            latency_ms,
            mut dialer,
        } = probe;

        let lookup = timeout(self.config.timeout, dialer.get(&self.config.url)).await;
        dialer.release();

        let response = match lookup {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(ScanError::ClassifierUnreachable(e.to_string())),
            Err(_) => {
                return Err(ScanError::ClassifierUnreachable(
                    "lookup timed out".to_string(),
                ))
            }
        };

        if !(200..300).contains(&response.status) {
            return Err(ScanError::ClassifierInconclusive(format!(
                "lookup status {}",
                response.status
            )));
        }

        let info: OriginInfo = serde_json::from_slice(&response.body)
            .map_err(|e| ScanError::ClassifierInconclusive(format!("bad payload: {}", e)))?;

        if !info.is_success() {
            return Err(ScanError::ClassifierInconclusive(
                info.message
                    .clone()
                    .unwrap_or_else(|| format!("status '{}'", info.status)),
            ));
        }

        let needed = info.observed_ip.is_some() || self.policy.has_cidr_rules();
        let dialed = dialed_addresses(&endpoint, needed, self.config.timeout).await;
        let tags = self.policy.tags(&info);

        let verdict = match self.policy.evaluate(&endpoint, &dialed, &info) {
            Decision::Accept { tags, observed_ip } => {
                debug!(tags = %tags, isp = %info.isp_name, "Accepted");
                Verdict::accepted(endpoint, protocol, latency_ms, tags, observed_ip)
            }
            Decision::Reject(rejection) => {
                debug!(isp = %info.isp_name, "Rejected: {}", rejection);
                Verdict::rejected(endpoint, protocol, latency_ms, tags, rejection)
            }
        };

        Ok(verdict)
    }
}

/// Addresses the endpoint's host stands for
///
/// Hostnames are only resolved when the leak check or a CIDR ban will need them.
async fn dialed_addresses(endpoint: &Endpoint, needed: bool, limit: Duration) -> Vec<IpAddr> {
    if let Some(ip) = endpoint.ip() {
        return vec![ip];
    }
    if !needed {
        return Vec::new();
    }

    let resolution = tokio::net::lookup_host((endpoint.host(), endpoint.port()));
    resolve_within(limit, endpoint.host(), resolution).await
}

/// Await a resolution for at most `limit`
///
/// Errors and expiry both yield no addresses, so a leak check that follows fails closed.
async fn resolve_within<F, I>(limit: Duration, host: &str, resolution: F) -> Vec<IpAddr>
where
    F: Future<Output = io::Result<I>>,
    I: Iterator<Item = SocketAddr>,
{
    match timeout(limit, resolution).await {
        Ok(Ok(addrs)) => addrs.map(|a| a.ip()).collect(),
        Ok(Err(e)) => {
            debug!(host = %host, "Resolution failed: {}", e);
            Vec::new()
        }
        Err(_) => {
            debug!(host = %host, "Resolution timed out");
            Vec::new()
        }
    }
}
