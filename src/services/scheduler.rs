//! Bounded worker pool driving candidates through the validation pipeline
//!
//! Workers pull endpoints from a shared FIFO queue and run race → classify →
//! record for each one. A failing or panicking candidate never affects its
//! siblings. The batch deadline and the external shutdown signal only stop
//! intake; in-flight candidates run out their own probe timeouts.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, SchedulerConfig};
use crate::error::Result;
use crate::models::{Endpoint, Verdict};
use crate::proxy::classifier::{LookupConfig, OriginClassifier};
use crate::proxy::policy::FilterPolicy;
use crate::proxy::race::{LivenessConfig, RaceResolver};
use crate::proxy::transport::{TransportBuilder, TunnelBuilder};
use crate::repository::{ResultAggregator, ResultSet};

/// Per-candidate validation: race, then classify through the winner
pub struct Pipeline {
    resolver: RaceResolver,
    classifier: OriginClassifier,
}

impl Pipeline {
    pub fn new(resolver: RaceResolver, classifier: OriginClassifier) -> Self {
        Self {
            resolver,
            classifier,
        }
    }

    /// Build the production pipeline over real tunnels
    pub fn from_config(config: &Config) -> Result<Self> {
        let builder: Arc<dyn TransportBuilder> = Arc::new(TunnelBuilder::new()?);
        Ok(Self::with_builder(builder, config))
    }

    pub fn with_builder(builder: Arc<dyn TransportBuilder>, config: &Config) -> Self {
        Self::new(
            RaceResolver::new(builder, LivenessConfig::from_config(&config.probe)),
            OriginClassifier::new(
                FilterPolicy::from_config(&config.filter),
                LookupConfig::from_config(&config.probe),
            ),
        )
    }

    /// Validate one endpoint end to end
    pub async fn check(&self, endpoint: &Endpoint) -> Result<Verdict> {
        let probe = self.resolver.resolve(endpoint).await?;
        self.classifier.classify(probe).await
    }
}

/// Why intake stopped before the queue drained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Deadline,
    Shutdown,
}

/// Outcome of one batch
#[derive(Debug)]
pub struct BatchReport {
    pub results: ResultSet,
    /// Candidates taken off the queue
    pub processed: usize,
    pub accepted: usize,
    /// Rejected by policy
    pub rejected: usize,
    /// Dropped on an error or panic
    pub failed: usize,
    /// Candidates never started
    pub pending: usize,
    pub stopped: Option<StopReason>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn is_partial(&self) -> bool {
        self.stopped.is_some() && self.pending > 0
    }
}

#[derive(Default)]
struct Counters {
    processed: AtomicUsize,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
    failed: AtomicUsize,
}

/// Concurrency scheduler
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    aggregator: Arc<ResultAggregator>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<Pipeline>,
        aggregator: Arc<ResultAggregator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pipeline,
            aggregator,
            config,
        }
    }

    /// Run a batch until the queue drains, the deadline passes, or shutdown
    #[instrument(skip(self, endpoints, shutdown), fields(candidates = endpoints.len()))]
    pub async fn run(
        &self,
        endpoints: Vec<Endpoint>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BatchReport {
        let start = Instant::now();
        let worker_count = self.config.workers.max(1).min(endpoints.len().max(1));

        info!(
            "Starting batch ({} candidates, {} workers, deadline: {}s)",
            endpoints.len(),
            worker_count,
            self.config.deadline.as_secs()
        );

        let queue = Arc::new(Mutex::new(VecDeque::from(endpoints)));
        let counters = Arc::new(Counters::default());
        let (stop_tx, stop_rx) = watch::channel(None::<StopReason>);

        if *shutdown.borrow() {
            stop_tx.send_replace(Some(StopReason::Shutdown));
        }

        let deadline = self.config.deadline;
        let stopper = tokio::spawn(async move {
            if stop_tx.borrow().is_some() {
                return;
            }

            let expiry = sleep(deadline);
            tokio::pin!(expiry);
            let mut watching = true;

            loop {
                tokio::select! {
                    _ = &mut expiry => {
                        warn!("Batch deadline reached, stopping intake");
                        stop_tx.send_replace(Some(StopReason::Deadline));
                        break;
                    }
                    changed = shutdown.changed(), if watching => {
                        if changed.is_err() {
                            // Sender gone; only the deadline can stop us now.
                            watching = false;
                        } else if *shutdown.borrow() {
                            info!("Shutdown requested, stopping intake");
                            stop_tx.send_replace(Some(StopReason::Shutdown));
                            break;
                        }
                    }
                }
            }
        });

        let workers: Vec<_> = (0..worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    pipeline: self.pipeline.clone(),
                    aggregator: self.aggregator.clone(),
                    queue: queue.clone(),
                    counters: counters.clone(),
                    stop: stop_rx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        stopper.abort();

        let stopped = *stop_rx.borrow();
        let pending = queue.lock().len();
        let report = BatchReport {
            results: self.aggregator.snapshot(),
            processed: counters.processed.load(Ordering::SeqCst),
            accepted: counters.accepted.load(Ordering::SeqCst),
            rejected: counters.rejected.load(Ordering::SeqCst),
            failed: counters.failed.load(Ordering::SeqCst),
            pending,
            stopped,
            elapsed: start.elapsed(),
        };

        info!(
            processed = report.processed,
            accepted = report.accepted,
            rejected = report.rejected,
            failed = report.failed,
            pending = report.pending,
            "Batch finished in {:.1}s",
            report.elapsed.as_secs_f64()
        );

        report
    }
}

struct Worker {
    id: usize,
    pipeline: Arc<Pipeline>,
    aggregator: Arc<ResultAggregator>,
    queue: Arc<Mutex<VecDeque<Endpoint>>>,
    counters: Arc<Counters>,
    stop: watch::Receiver<Option<StopReason>>,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.stop.borrow().is_some() {
                debug!(worker = self.id, "Intake stopped");
                break;
            }

            let next = self.queue.lock().pop_front();
            let Some(endpoint) = next else {
                break;
            };

            let outcome = AssertUnwindSafe(self.pipeline.check(&endpoint))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(verdict)) if verdict.accepted => {
                    info!(
                        endpoint = %endpoint,
                        protocol = %verdict.protocol,
                        latency_ms = verdict.latency_ms,
                        tags = %verdict.tags,
                        "Accepted"
                    );
                    self.aggregator.record(verdict);
                    self.counters.accepted.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Ok(verdict)) => {
                    if let Some(rejection) = &verdict.rejection {
                        debug!(endpoint = %endpoint, "Rejected: {}", rejection);
                    }
                    self.counters.rejected.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Err(e)) => {
                    debug!(endpoint = %endpoint, stage = ?e.stage(), "Dropped: {}", e);
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                }
                Err(_) => {
                    warn!(endpoint = %endpoint, "Candidate pipeline panicked");
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                }
            }

            self.counters.processed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Handle for stopping a running batch from outside
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl SchedulerHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for SchedulerHandle {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::ScanError;
    use crate::models::Protocol;
    use crate::proxy::testing::{
        liveness_url, lookup_url, residential_lookup, FakeTransport, Reply, Script,
    };
    use crate::proxy::transport::Dialer;

    fn pipeline(builder: Arc<dyn TransportBuilder>, probe_timeout_ms: u64) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            RaceResolver::new(
                builder,
                LivenessConfig {
                    url: liveness_url(),
                    timeout: Duration::from_millis(probe_timeout_ms),
                    min_body_len: 512,
                    challenge_markers: Vec::new(),
                },
            ),
            OriginClassifier::new(
                FilterPolicy::new(&[], &[], &["hosting".to_string()], &["mobile".to_string()]),
                LookupConfig {
                    url: lookup_url(),
                    timeout: Duration::from_millis(probe_timeout_ms),
                },
            ),
        ))
    }

    fn scheduler(pipeline: Arc<Pipeline>, workers: usize, deadline: Duration) -> Scheduler {
        Scheduler::new(
            pipeline,
            Arc::new(ResultAggregator::new()),
            SchedulerConfig { workers, deadline },
        )
    }

    fn live(transport: &FakeTransport, identity: &str, protocol: Protocol, isp: &str) {
        transport.script(
            identity,
            protocol,
            Script {
                liveness: Reply::ok(5, 900),
                lookup: Reply::json(&residential_lookup("US", isp)),
            },
        );
    }

    fn endpoints(raw: &[&str]) -> Vec<Endpoint> {
        raw.iter().map(|r| Endpoint::parse(r).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_mixed_batch_isolates_failures() {
        let transport = Arc::new(FakeTransport::new());
        live(&transport, "1.1.1.1:80", Protocol::Http, "Comcast Cable");
        live(&transport, "2.2.2.2:1080", Protocol::Socks5, "Example Hosting");
        transport.script(
            "3.3.3.3:80",
            Protocol::Http,
            Script {
                liveness: Reply::Refuse,
                lookup: Reply::Refuse,
            },
        );
        transport.script(
            "4.4.4.4:80",
            Protocol::Http,
            Script {
                liveness: Reply::ok(5, 900),
                lookup: Reply::json(r#"{"status":"fail","message":"private range"}"#),
            },
        );
        live(&transport, "5.5.5.5:3128", Protocol::Http, "Verizon Fios");

        let scheduler = scheduler(pipeline(transport.clone(), 500), 3, Duration::from_secs(10));
        let (_handle, shutdown) = SchedulerHandle::new();

        let report = scheduler
            .run(
                endpoints(&[
                    "http://1.1.1.1:80",
                    "socks5://2.2.2.2:1080",
                    "http://3.3.3.3:80",
                    "http://4.4.4.4:80",
                    "http://5.5.5.5:3128",
                ]),
                shutdown,
            )
            .await;

        assert_eq!(report.processed, 5);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.pending, 0);
        assert_eq!(report.stopped, None);
        assert!(!report.is_partial());
        assert_eq!(
            report.results.proxy_urls(),
            vec![
                "http://1.1.1.1:80".to_string(),
                "http://5.5.5.5:3128".to_string()
            ]
        );
        assert_eq!(transport.builds(), transport.releases());
    }

    #[tokio::test]
    async fn test_deadline_returns_partial_results() {
        let transport = Arc::new(FakeTransport::new());
        live(&transport, "1.1.1.1:80", Protocol::Http, "Comcast Cable");
        for i in 2..=9 {
            transport.script(
                &format!("10.0.0.{}:80", i),
                Protocol::Http,
                Script {
                    liveness: Reply::Hang,
                    lookup: Reply::Hang,
                },
            );
        }

        let mut raw = vec!["http://1.1.1.1:80".to_string()];
        raw.extend((2..=9).map(|i| format!("http://10.0.0.{}:80", i)));
        let raw: Vec<&str> = raw.iter().map(String::as_str).collect();

        // Each hanging candidate takes 300ms; the whole queue would need ~1.2s.
        let scheduler = scheduler(pipeline(transport.clone(), 300), 2, Duration::from_millis(400));
        let (_handle, shutdown) = SchedulerHandle::new();

        let started = Instant::now();
        let report = scheduler.run(endpoints(&raw), shutdown).await;

        assert_eq!(report.stopped, Some(StopReason::Deadline));
        assert!(report.is_partial());
        assert!(report.pending > 0);
        assert_eq!(report.results.len(), 1);
        assert!(report.results.contains("1.1.1.1:80"));
        // In-flight probes are bounded by their own timeout.
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(transport.builds(), transport.releases());
    }

    #[tokio::test]
    async fn test_shutdown_before_start_processes_nothing() {
        let transport = Arc::new(FakeTransport::new());
        live(&transport, "1.1.1.1:80", Protocol::Http, "Comcast Cable");

        let scheduler = scheduler(pipeline(transport.clone(), 500), 4, Duration::from_secs(10));
        let (handle, shutdown) = SchedulerHandle::new();
        handle.shutdown();

        let report = scheduler.run(endpoints(&["http://1.1.1.1:80"]), shutdown).await;

        assert_eq!(report.stopped, Some(StopReason::Shutdown));
        assert_eq!(report.processed, 0);
        assert_eq!(report.pending, 1);
        assert!(report.results.is_empty());
        assert_eq!(transport.builds(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_batch_stops_intake() {
        let transport = Arc::new(FakeTransport::new());
        for i in 1..=6 {
            transport.script(
                &format!("10.0.0.{}:80", i),
                Protocol::Http,
                Script {
                    liveness: Reply::Hang,
                    lookup: Reply::Hang,
                },
            );
        }
        let raw: Vec<String> = (1..=6).map(|i| format!("http://10.0.0.{}:80", i)).collect();
        let raw: Vec<&str> = raw.iter().map(String::as_str).collect();

        let scheduler = scheduler(pipeline(transport.clone(), 200), 1, Duration::from_secs(60));
        let (handle, shutdown) = SchedulerHandle::new();

        let batch = scheduler.run(endpoints(&raw), shutdown);
        let trigger = async {
            sleep(Duration::from_millis(50)).await;
            handle.shutdown();
        };
        let (report, _) = tokio::join!(batch, trigger);

        assert_eq!(report.stopped, Some(StopReason::Shutdown));
        assert_eq!(report.processed, 1);
        assert_eq!(report.pending, 5);
        assert_eq!(transport.builds(), transport.releases());
    }

    struct PanickingBuilder {
        inner: Arc<FakeTransport>,
    }

    impl TransportBuilder for PanickingBuilder {
        fn build(&self, endpoint: &Endpoint, protocol: Protocol) -> Result<Box<dyn Dialer>> {
            if endpoint.host() == "6.6.6.6" {
                panic!("builder exploded");
            }
            self.inner.build(endpoint, protocol)
        }
    }

    #[tokio::test]
    async fn test_panicking_candidate_is_isolated() {
        let transport = Arc::new(FakeTransport::new());
        live(&transport, "1.1.1.1:80", Protocol::Http, "Comcast Cable");

        let builder = Arc::new(PanickingBuilder {
            inner: transport.clone(),
        });
        let scheduler = scheduler(pipeline(builder, 500), 1, Duration::from_secs(10));
        let (_handle, shutdown) = SchedulerHandle::new();

        let report = scheduler
            .run(endpoints(&["http://6.6.6.6:80", "http://1.1.1.1:80"]), shutdown)
            .await;

        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.accepted, 1);
        assert!(report.results.contains("1.1.1.1:80"));
    }

    #[tokio::test]
    async fn test_pipeline_check_reports_stage() {
        let transport = Arc::new(FakeTransport::new());
        let pipeline = pipeline(transport, 100);

        let endpoint = Endpoint::parse("http://9.9.9.9:80").unwrap();
        let err = tokio_test::assert_err!(pipeline.check(&endpoint).await);
        assert!(matches!(err, ScanError::NoLiveProtocol { attempts: 1 }));
        assert!(!err.is_fatal());
    }
}
