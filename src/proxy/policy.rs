//! Exclusion filter chain applied to origin lookups
//!
//! Evaluation order is fixed: leak check, subnet bans, ASN bans, then the
//! keyword/hosting stage, which is the only one a mobile network can waive.

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::config::FilterConfig;
use crate::models::{Endpoint, Mobility, OriginInfo, Rejection, Tags};

/// One banned-subnet entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetRule {
    Cidr(IpNetwork),
    Prefix(String),
}

impl SubnetRule {
    /// Parse `10.0.0.0/8`, a bare address, or a textual prefix such as `185.220.`
    pub fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return None;
        }

        if let Ok(network) = pattern.parse::<IpNetwork>() {
            return Some(SubnetRule::Cidr(network));
        }
        if let Ok(ip) = pattern.parse::<IpAddr>() {
            return Some(SubnetRule::Cidr(IpNetwork::from(ip)));
        }

        Some(SubnetRule::Prefix(pattern.to_lowercase()))
    }

    /// CIDR rules test every address the host stands for; prefixes test the host text
    pub fn matches(&self, host: &str, addresses: &[IpAddr]) -> bool {
        match self {
            SubnetRule::Cidr(network) => addresses.iter().any(|ip| network.contains(*ip)),
            SubnetRule::Prefix(prefix) => host.starts_with(prefix.as_str()),
        }
    }

    pub fn is_cidr(&self) -> bool {
        matches!(self, SubnetRule::Cidr(_))
    }

    pub fn pattern(&self) -> String {
        match self {
            SubnetRule::Cidr(network) => network.to_string(),
            SubnetRule::Prefix(prefix) => prefix.clone(),
        }
    }
}

/// Outcome of running the filter chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept {
        tags: Tags,
        observed_ip: Option<IpAddr>,
    },
    Reject(Rejection),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept { .. })
    }
}

/// Configured ban lists
#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    subnets: Vec<SubnetRule>,
    asns: Vec<String>,
    keywords: Vec<String>,
    mobile_markers: Vec<String>,
}

impl FilterPolicy {
    pub fn new(
        subnets: &[String],
        asns: &[String],
        keywords: &[String],
        mobile_markers: &[String],
    ) -> Self {
        Self {
            subnets: subnets.iter().filter_map(|s| SubnetRule::parse(s)).collect(),
            asns: normalize_terms(asns),
            keywords: normalize_terms(keywords),
            mobile_markers: normalize_terms(mobile_markers),
        }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(
            &config.banned_subnets,
            &config.banned_asns,
            &config.banned_keywords,
            &config.mobile_markers,
        )
    }

    /// Explicit mobile flag, or a carrier marker in the ISP/organization text
    pub fn is_mobile(&self, info: &OriginInfo) -> bool {
        if info.is_mobile {
            return true;
        }

        let isp = info.isp_name.to_lowercase();
        let org = info.org_name.to_lowercase();
        self.mobile_markers
            .iter()
            .any(|m| isp.contains(m.as_str()) || org.contains(m.as_str()))
    }

    pub fn tags(&self, info: &OriginInfo) -> Tags {
        Tags {
            country: info.country_code.to_uppercase(),
            mobility: if self.is_mobile(info) {
                Mobility::Mobile
            } else {
                Mobility::NonMobile
            },
        }
    }

    /// Leak check: the lookup service must have seen one of the dialed addresses
    ///
    /// Returns the parsed observed address (if any) when the check passes.
    pub fn check_leak(
        dialed: &[IpAddr],
        observed: Option<&str>,
    ) -> std::result::Result<Option<IpAddr>, Rejection> {
        let Some(observed) = observed.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };

        match observed.parse::<IpAddr>() {
            Ok(ip) if dialed.contains(&ip) => Ok(Some(ip)),
            _ => Err(Rejection::Leak {
                observed: observed.to_string(),
            }),
        }
    }

    /// Whether any rule needs the resolved addresses of a hostname
    pub fn has_cidr_rules(&self) -> bool {
        self.subnets.iter().any(SubnetRule::is_cidr)
    }

    pub fn match_subnet(&self, endpoint: &Endpoint, dialed: &[IpAddr]) -> Option<&SubnetRule> {
        let mut addresses = dialed.to_vec();
        if let Some(ip) = endpoint.ip() {
            if !addresses.contains(&ip) {
                addresses.push(ip);
            }
        }

        self.subnets
            .iter()
            .find(|rule| rule.matches(endpoint.host(), &addresses))
    }

    pub fn match_asn(&self, info: &OriginInfo) -> Option<&str> {
        let label = info.asn_label.to_lowercase();
        if label.is_empty() {
            return None;
        }
        self.asns
            .iter()
            .find(|entry| label.contains(entry.as_str()))
            .map(String::as_str)
    }

    pub fn match_keyword(&self, info: &OriginInfo) -> Option<&str> {
        let haystacks = [
            info.isp_name.to_lowercase(),
            info.org_name.to_lowercase(),
            info.asn_label.to_lowercase(),
        ];
        self.keywords
            .iter()
            .find(|term| haystacks.iter().any(|h| h.contains(term.as_str())))
            .map(String::as_str)
    }

    /// Run the whole chain for one endpoint
    ///
    /// `dialed` holds the addresses the endpoint's host stands for.
    pub fn evaluate(&self, endpoint: &Endpoint, dialed: &[IpAddr], info: &OriginInfo) -> Decision {
        let observed_ip = match Self::check_leak(dialed, info.observed_ip.as_deref()) {
            Ok(ip) => ip,
            Err(rejection) => return Decision::Reject(rejection),
        };

        if let Some(rule) = self.match_subnet(endpoint, dialed) {
            return Decision::Reject(Rejection::Subnet {
                pattern: rule.pattern(),
            });
        }

        if let Some(entry) = self.match_asn(info) {
            return Decision::Reject(Rejection::Asn {
                entry: entry.to_string(),
            });
        }

        let mobile = self.is_mobile(info);
        if !mobile {
            if let Some(term) = self.match_keyword(info) {
                return Decision::Reject(Rejection::Keyword {
                    term: term.to_string(),
                });
            }
            if info.is_hosting {
                return Decision::Reject(Rejection::Hosting);
            }
        }

        Decision::Accept {
            tags: self.tags(info),
            observed_ip,
        }
    }
}

fn normalize_terms(terms: &[String]) -> Vec<String> {
    terms
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}
