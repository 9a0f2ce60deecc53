use std::env;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{Result, ScanError};

pub const DEFAULT_LIVENESS_URL: &str = "https://ya.ru";
pub const DEFAULT_ORIGIN_LOOKUP_URL: &str =
    "http://ip-api.com/json/?fields=status,message,countryCode,isp,org,as,mobile,hosting,query";

/// Terms marking datacenter/hosting networks
pub const DEFAULT_BANNED_KEYWORDS: &[&str] = &[
    "hosting",
    "cloud",
    "datacenter",
    "vps",
    "server",
    "ovh",
    "hetzner",
    "digitalocean",
    "amazon",
    "aws",
    "google",
    "microsoft",
    "azure",
    "oracle",
    "alibaba",
    "tencent",
    "linode",
    "vultr",
    "m247",
    "choopa",
    "tor",
    "vpn",
    "dedicated",
    "leaseweb",
    "clouvider",
    "cogent",
    "gtt",
    "ipxo",
];

/// Terms marking mobile carrier networks
pub const DEFAULT_MOBILE_MARKERS: &[&str] = &["mobile", "wireless", "cellular", "gsm", "lte"];

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Liveness and origin lookup probes
    pub probe: ProbeConfig,
    /// Exclusion filter lists
    pub filter: FilterConfig,
    /// Worker pool and batch deadline
    pub scheduler: SchedulerConfig,
    /// Candidate sources
    pub source: SourceConfig,
    /// Result persistence
    pub output: OutputConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Hard timeout for one liveness probe (default: 8s)
    pub probe_timeout: Duration,
    /// Timeout for the origin lookup (default: 5s)
    pub lookup_timeout: Duration,
    /// Minimum liveness response body length (default: 512)
    pub min_body_length: usize,
    /// URL fetched through each candidate to prove liveness
    pub liveness_url: Url,
    /// Origin lookup service URL (ip-api.com field layout)
    pub origin_lookup_url: Url,
    /// Body markers a 403 must carry to count as a challenge page (empty = any 403)
    pub challenge_markers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    /// CIDRs, addresses or textual prefixes to exclude
    pub banned_subnets: Vec<String>,
    /// AS identifiers to exclude (substring match)
    pub banned_asns: Vec<String>,
    /// ISP/organization terms to exclude unless mobile
    pub banned_keywords: Vec<String>,
    /// ISP/organization terms marking mobile carriers
    pub mobile_markers: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            banned_subnets: Vec::new(),
            banned_asns: Vec::new(),
            banned_keywords: to_strings(DEFAULT_BANNED_KEYWORDS),
            mobile_markers: to_strings(DEFAULT_MOBILE_MARKERS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of concurrent workers (default: 50)
    pub workers: usize,
    /// Global batch deadline (default: 45 minutes)
    pub deadline: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 50,
            deadline: Duration::from_secs(45 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// File listing candidates and remote list URLs
    pub sources_file: PathBuf,
    /// Timeout for fetching one remote list
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    /// Final snapshot destination
    pub output_file: PathBuf,
    /// Optional live append file
    pub stream_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let workers: usize = get_env_or("WORKERS", "50")
            .parse()
            .map_err(|_| ScanError::InvalidConfig("WORKERS must be a valid number".into()))?;
        if workers == 0 {
            return Err(ScanError::InvalidConfig("WORKERS must be at least 1".into()));
        }

        Ok(Config {
            probe: ProbeConfig {
                probe_timeout: Duration::from_millis(parse_number("PROBE_TIMEOUT_MS", 8000)?),
                lookup_timeout: Duration::from_millis(parse_number("LOOKUP_TIMEOUT_MS", 5000)?),
                min_body_length: parse_number("MIN_BODY_LENGTH", 512)? as usize,
                liveness_url: parse_http_url("LIVENESS_URL", DEFAULT_LIVENESS_URL)?,
                origin_lookup_url: parse_http_url("ORIGIN_LOOKUP_URL", DEFAULT_ORIGIN_LOOKUP_URL)?,
                challenge_markers: parse_list("CHALLENGE_MARKERS", &[]),
            },
            filter: FilterConfig {
                banned_subnets: parse_list("BANNED_SUBNETS", &[]),
                banned_asns: parse_list("BANNED_ASNS", &[]),
                banned_keywords: parse_list("BANNED_KEYWORDS", DEFAULT_BANNED_KEYWORDS),
                mobile_markers: parse_list("MOBILE_MARKERS", DEFAULT_MOBILE_MARKERS),
            },
            scheduler: SchedulerConfig {
                workers,
                deadline: Duration::from_secs(parse_number("BATCH_DEADLINE_SECS", 45 * 60)?),
            },
            source: SourceConfig {
                sources_file: PathBuf::from(get_env_or("SOURCES_FILE", "sources.txt")),
                fetch_timeout: Duration::from_millis(parse_number(
                    "SOURCE_FETCH_TIMEOUT_MS",
                    15000,
                )?),
            },
            output: OutputConfig {
                output_file: PathBuf::from(get_env_or("OUTPUT_FILE", "valid_proxies.txt")),
                stream_file: env::var("STREAM_FILE")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Default tracing filter directive
    pub fn log_directive(&self) -> String {
        format!("relay_validator={}", self.log.level)
    }
}

fn parse_number(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ScanError::InvalidConfig(format!("{} must be a valid number", key))),
        Err(_) => Ok(default),
    }
}

fn parse_http_url(key: &str, default: &str) -> Result<Url> {
    let raw = get_env_or(key, default);
    let url = Url::parse(raw.trim())
        .map_err(|e| ScanError::InvalidConfig(format!("{} must be a valid URL: {}", key, e)))?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ScanError::InvalidConfig(format!(
            "{} has unsupported scheme: {}",
            key, other
        ))),
    }
}

/// Comma-separated list; an explicitly empty variable clears the default
fn parse_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => to_strings(default),
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
