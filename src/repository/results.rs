use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{Tags, Verdict};

/// Deduplicated accepted verdicts keyed by endpoint identity
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    entries: HashMap<String, Verdict>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<&Verdict> {
        self.entries.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    /// Group verdicts by `(country, mobility)`, each group sorted by latency
    pub fn partition(&self) -> BTreeMap<Tags, Vec<Verdict>> {
        let mut groups: BTreeMap<Tags, Vec<Verdict>> = BTreeMap::new();
        for verdict in self.entries.values() {
            groups
                .entry(verdict.tags.clone())
                .or_default()
                .push(verdict.clone());
        }
        for group in groups.values_mut() {
            group.sort_by_key(|v| v.latency_ms);
        }
        groups
    }

    /// Sorted `scheme://host:port` lines
    pub fn proxy_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.entries.values().map(Verdict::proxy_url).collect();
        urls.sort();
        urls
    }
}

/// Collects accepted verdicts from concurrent workers
///
/// When built with a stream sender, every newly accepted verdict is also
/// handed off immediately for incremental persistence.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    entries: DashMap<String, Verdict>,
    stream: Option<mpsc::UnboundedSender<Verdict>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(stream: mpsc::UnboundedSender<Verdict>) -> Self {
        Self {
            entries: DashMap::new(),
            stream: Some(stream),
        }
    }

    /// Record a verdict; only accepted ones are kept
    ///
    /// Returns whether the verdict was stored. Last write for an identity wins.
    pub fn record(&self, verdict: Verdict) -> bool {
        if !verdict.accepted {
            return false;
        }

        let identity = verdict.identity();
        if let Some(stream) = &self.stream {
            if stream.send(verdict.clone()).is_err() {
                warn!(endpoint = %identity, "Result stream closed, keeping verdict in memory only");
            }
        }

        if self.entries.insert(identity.clone(), verdict).is_some() {
            debug!(endpoint = %identity, "Replaced existing verdict");
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of everything recorded so far
    pub fn snapshot(&self) -> ResultSet {
        ResultSet {
            entries: self
                .entries
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        }
    }
}
