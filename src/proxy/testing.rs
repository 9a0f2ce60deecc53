//! Scripted transports for pipeline tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;

use crate::error::{Result, ScanError};
use crate::models::{Endpoint, Protocol};
use crate::proxy::transport::{Dialer, HttpResponse, TransportBuilder};

pub const LIVENESS_URL: &str = "http://liveness.test/";
pub const LOOKUP_URL: &str = "http://lookup.test/json";

/// What a fake dialer does for one kind of request
#[derive(Debug, Clone)]
pub enum Reply {
    Respond {
        delay: Duration,
        status: u16,
        body: Bytes,
    },
    Refuse,
    Hang,
}

impl Reply {
    pub fn ok(delay_ms: u64, body_len: usize) -> Self {
        Reply::Respond {
            delay: Duration::from_millis(delay_ms),
            status: 200,
            body: Bytes::from(vec![b'x'; body_len]),
        }
    }

    pub fn status(delay_ms: u64, status: u16, body: &str) -> Self {
        Reply::Respond {
            delay: Duration::from_millis(delay_ms),
            status,
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn json(body: &str) -> Self {
        Self::status(0, 200, body)
    }
}

/// Behaviour of one `(endpoint, protocol)` pair
#[derive(Debug, Clone)]
pub struct Script {
    pub liveness: Reply,
    pub lookup: Reply,
}

/// Transport builder driven by scripts, counting builds and releases
#[derive(Default)]
pub struct FakeTransport {
    scripts: Mutex<HashMap<(String, Protocol), Script>>,
    pub builds: Arc<AtomicUsize>,
    pub releases: Arc<AtomicUsize>,
    pub lookups: Arc<AtomicUsize>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, identity: &str, protocol: Protocol, script: Script) {
        self.scripts
            .lock()
            .insert((identity.to_string(), protocol), script);
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl TransportBuilder for FakeTransport {
    fn build(&self, endpoint: &Endpoint, protocol: Protocol) -> Result<Box<dyn Dialer>> {
        let script = self
            .scripts
            .lock()
            .get(&(endpoint.identity(), protocol))
            .cloned()
            .ok_or_else(|| ScanError::BuildError {
                protocol,
                reason: "no script".to_string(),
            })?;

        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDialer {
            script,
            releases: self.releases.clone(),
            lookups: self.lookups.clone(),
        }))
    }
}

struct FakeDialer {
    script: Script,
    releases: Arc<AtomicUsize>,
    lookups: Arc<AtomicUsize>,
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        let reply = if url.host_str() == Some("lookup.test") {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            &self.script.lookup
        } else {
            &self.script.liveness
        };

        match reply {
            Reply::Respond {
                delay,
                status,
                body,
            } => {
                tokio::time::sleep(*delay).await;
                Ok(HttpResponse::new(*status, body.clone()))
            }
            Reply::Refuse => Err(ScanError::TunnelError("connection refused".to_string())),
            Reply::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn liveness_url() -> Url {
    Url::parse(LIVENESS_URL).unwrap()
}

pub fn lookup_url() -> Url {
    Url::parse(LOOKUP_URL).unwrap()
}

pub fn residential_lookup(country: &str, isp: &str) -> String {
    format!(
        r#"{{"status":"success","countryCode":"{}","isp":"{}","org":"{}","as":"AS7922 Example","mobile":false,"hosting":false}}"#,
        country, isp, isp
    )
}
