use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Endpoint, Protocol};

/// Origin lookup payload (ip-api.com field layout)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OriginInfo {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "countryCode")]
    pub country_code: String,
    #[serde(default, rename = "isp")]
    pub isp_name: String,
    #[serde(default, rename = "org")]
    pub org_name: String,
    #[serde(default, rename = "as")]
    pub asn_label: String,
    #[serde(default, rename = "mobile")]
    pub is_mobile: bool,
    #[serde(default, rename = "hosting")]
    pub is_hosting: bool,
    /// Public IP the lookup service saw the request coming from
    #[serde(default, rename = "query")]
    pub observed_ip: Option<String>,
}

impl OriginInfo {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}

/// Mobility tag of an accepted endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mobility {
    Mobile,
    NonMobile,
}

impl Mobility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mobility::Mobile => "mobile",
            Mobility::NonMobile => "non-mobile",
        }
    }
}

impl std::fmt::Display for Mobility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification tags used to partition results
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tags {
    pub country: String,
    pub mobility: Mobility,
}

impl std::fmt::Display for Tags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let country = if self.country.is_empty() {
            "??"
        } else {
            self.country.as_str()
        };
        write!(f, "{}/{}", country, self.mobility)
    }
}

/// Why the exclusion filter turned an endpoint down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rejection {
    Leak { observed: String },
    Subnet { pattern: String },
    Asn { entry: String },
    Keyword { term: String },
    Hosting,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Leak { observed } => write!(f, "leak (observed {})", observed),
            Rejection::Subnet { pattern } => write!(f, "banned subnet {}", pattern),
            Rejection::Asn { entry } => write!(f, "banned ASN {}", entry),
            Rejection::Keyword { term } => write!(f, "banned keyword '{}'", term),
            Rejection::Hosting => write!(f, "hosting network"),
        }
    }
}

/// Terminal decision for one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub endpoint: Endpoint,
    pub protocol: Protocol,
    pub latency_ms: u64,
    pub accepted: bool,
    pub tags: Tags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    pub checked_at: DateTime<Utc>,
}

impl Verdict {
    pub fn accepted(
        endpoint: Endpoint,
        protocol: Protocol,
        latency_ms: u64,
        tags: Tags,
        observed_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            endpoint,
            protocol,
            latency_ms,
            accepted: true,
            tags,
            observed_ip,
            rejection: None,
            checked_at: Utc::now(),
        }
    }

    pub fn rejected(
        endpoint: Endpoint,
        protocol: Protocol,
        latency_ms: u64,
        tags: Tags,
        rejection: Rejection,
    ) -> Self {
        Self {
            endpoint,
            protocol,
            latency_ms,
            accepted: false,
            tags,
            observed_ip: None,
            rejection: Some(rejection),
            checked_at: Utc::now(),
        }
    }

    /// Identity of the underlying endpoint
    pub fn identity(&self) -> String {
        self.endpoint.identity()
    }

    /// `scheme://host:port` line as handed to persistence
    pub fn proxy_url(&self) -> String {
        self.endpoint.url(self.protocol)
    }

    pub fn is_mobile(&self) -> bool {
        self.tags.mobility == Mobility::Mobile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_info_deserializes_ip_api_payload() {
        let info: OriginInfo = serde_json::from_str(
            r#"{"status":"success","countryCode":"US","isp":"Comcast Cable",
                "org":"Comcast","as":"AS7922 Comcast Cable Communications, LLC",
                "mobile":false,"hosting":false,"query":"1.2.3.4"}"#,
        )
        .unwrap();

        assert!(info.is_success());
        assert_eq!(info.country_code, "US");
        assert_eq!(info.isp_name, "Comcast Cable");
        assert_eq!(info.asn_label, "AS7922 Comcast Cable Communications, LLC");
        assert!(!info.is_mobile);
        assert_eq!(info.observed_ip.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_origin_info_tolerates_failure_payload() {
        let info: OriginInfo =
            serde_json::from_str(r#"{"status":"fail","message":"private range"}"#).unwrap();
        assert!(!info.is_success());
        assert_eq!(info.message.as_deref(), Some("private range"));
        assert!(info.observed_ip.is_none());
    }

    #[test]
    fn test_verdict_proxy_url_and_tags() {
        let endpoint = Endpoint::parse("1.2.3.4:8080").unwrap();
        let verdict = Verdict::accepted(
            endpoint,
            Protocol::Socks5,
            300,
            Tags {
                country: "US".to_string(),
                mobility: Mobility::NonMobile,
            },
            None,
        );

        assert!(verdict.accepted);
        assert_eq!(verdict.proxy_url(), "socks5://1.2.3.4:8080");
        assert_eq!(verdict.tags.to_string(), "US/non-mobile");
        assert!(!verdict.is_mobile());
    }

    #[test]
    fn test_rejection_display() {
        assert_eq!(
            Rejection::Asn {
                entry: "AS16509".to_string()
            }
            .to_string(),
            "banned ASN AS16509"
        );
        assert_eq!(Rejection::Hosting.to_string(), "hosting network");
    }
}
