// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The session orchestrator.
//!
//! Fixed-target mode dispatches `readers` sessions at a token-bucket-paced
//! rate, with a semaphore capping concurrent establishment attempts and an
//! adaptive controller that halves the rate when the server starts failing
//! and creeps back up when it recovers. Real-world mode
//! ([`realworld::RealWorldController`]) instead chases a time-varying target.
//!
//! Every session is one tokio task; the orchestrator tracks them all and
//! waits for the full drain before returning.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::client::{RtspSession, SessionConfig};
use crate::rtp::Aggregator;
use crate::{Error, Transport};

pub mod badclient;
mod rate;
mod realworld;
mod stats;

pub use stats::{LatencySummary, StatsRecord};

use rate::RateLimiter;
use stats::LatencyRecorder;

/// Maximum connect attempts per session in fixed-target mode, with
/// 100/200/400 ms backoff between them.
const CONNECT_ATTEMPTS: u32 = 3;

/// Benchmark configuration.
#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub url: Url,
    /// Total sessions to dispatch (fixed-target mode).
    pub readers: usize,
    /// Target dispatch rate, sessions/second.
    pub rate: f64,
    /// Per-session lifetime.
    pub duration: Duration,
    pub transport: Transport,
    pub stats_interval: Duration,
    /// Chase a time-varying target instead of dispatching `readers` sessions.
    pub real_world: bool,
    /// Real-world mode: average active sessions.
    pub avg_connections: usize,
    /// Real-world mode: load variance in `[0, 1]`.
    pub variance: f64,
    /// Dedicate a fraction of spawn slots to misbehaving clients.
    pub bad_clients: bool,
    pub bad_client_ratio: f64,
}

/// Counters shared between the orchestrator, every session task, and the
/// stats surface.
pub(crate) struct Shared {
    pub(crate) active: AtomicI64,
    pub(crate) total_connects: AtomicI64,
    pub(crate) total_failures: AtomicI64,
    pub(crate) bad_clients: AtomicI64,
    pub(crate) target: AtomicI64,
    pub(crate) latency: LatencyRecorder,
    pub(crate) bad_client_types: Mutex<BTreeMap<String, i64>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            active: AtomicI64::new(0),
            total_connects: AtomicI64::new(0),
            total_failures: AtomicI64::new(0),
            bad_clients: AtomicI64::new(0),
            target: AtomicI64::new(0),
            latency: LatencyRecorder::new(),
            bad_client_types: Mutex::new(BTreeMap::new()),
        }
    }
}

/// Decrements `active` when the session task ends, whichever way it ends.
pub(crate) struct ActiveGuard(Arc<Shared>);

impl ActiveGuard {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        shared.active.fetch_add(1, Ordering::Relaxed);
        Self(shared.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Orchestrates one benchmark run.
pub struct Runner {
    config: BenchConfig,
    aggregator: Arc<Aggregator>,
    shared: Arc<Shared>,
}

impl Runner {
    pub fn new(mut config: BenchConfig, aggregator: Arc<Aggregator>) -> Self {
        config.bad_client_ratio = config.bad_client_ratio.clamp(0.0, 1.0);
        config.variance = config.variance.clamp(0.0, 1.0);
        Self {
            config,
            aggregator,
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Runs to completion: until all sessions have been dispatched and
    /// drained, or `cancel` fires and the drain finishes. There is no forced
    /// abort; sessions get their teardown window.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        if self.config.url.scheme() != "rtsp" {
            return Err(Error::InvalidArgument(format!(
                "unsupported scheme {:?} (only rtsp)",
                self.config.url.scheme()
            )));
        }
        if self.config.url.host().is_none() {
            return Err(Error::InvalidArgument(format!(
                "must specify host in rtsp url {}",
                self.config.url
            )));
        }

        if self.config.real_world {
            let controller = realworld::RealWorldController::new(
                self.config.clone(),
                self.aggregator.clone(),
                self.shared.clone(),
            );
            return controller.run(cancel).await;
        }

        info!(
            "starting benchmark: {} readers at {:.1}/s over {}",
            self.config.readers, self.config.rate, self.config.transport
        );
        let burst = (self.config.rate / 10.0).clamp(10.0, 100.0) as u32;
        let concurrency_cap = (self.config.readers / 10).clamp(10_000, 50_000);
        let mut limiter = RateLimiter::new(self.config.rate, burst);
        let semaphore = Arc::new(Semaphore::new(concurrency_cap));
        let tracker = TaskTracker::new();

        let mut dispatched: usize = 0;
        let mut last_check = Instant::now();
        let mut last_failures: i64 = 0;
        'dispatch: while dispatched < self.config.readers {
            // Adaptive pacing: every 10 dispatches, if the window is at least
            // 2 s old, react to the failure delta.
            if dispatched > 0
                && dispatched % 10 == 0
                && last_check.elapsed() > Duration::from_secs(2)
            {
                let failures = self.shared.total_failures.load(Ordering::Relaxed);
                let delta = failures - last_failures;
                if let Some(new_rate) = adjusted_rate(limiter.rate(), self.config.rate, delta) {
                    if new_rate < limiter.rate() {
                        info!(
                            "high failure rate ({delta}/10), reducing dispatch rate to {new_rate:.1}/s"
                        );
                    } else {
                        info!("no recent failures, raising dispatch rate to {new_rate:.1}/s");
                    }
                    limiter.set_rate(new_rate);
                }
                last_check = Instant::now();
                last_failures = failures;
            }

            tokio::select! {
                _ = cancel.cancelled() => break 'dispatch,
                _ = limiter.acquire() => {}
            }
            let permit = tokio::select! {
                _ = cancel.cancelled() => break 'dispatch,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'dispatch,
                },
            };

            if self.config.bad_clients
                && rand::thread_rng().gen_bool(self.config.bad_client_ratio)
            {
                tracker.spawn(bad_client_task(
                    self.config.url.clone(),
                    self.config.duration,
                    self.shared.clone(),
                    cancel.clone(),
                    Some(permit),
                ));
            } else {
                let session_config = SessionConfig {
                    url: self.config.url.clone(),
                    transport: self.config.transport,
                    lifetime: self.config.duration,
                };
                tracker.spawn(session_task(
                    session_config,
                    self.aggregator.clone(),
                    self.shared.clone(),
                    cancel.clone(),
                    Some(permit),
                    CONNECT_ATTEMPTS,
                ));
            }
            dispatched += 1;
            if (dispatched <= 1000 && dispatched % 100 == 0) || dispatched % 1000 == 0 {
                info!("dispatched {dispatched} sessions");
            }
        }
        info!("finished dispatching {dispatched} sessions, waiting for drain");
        tracker.close();
        tracker.wait().await;
        Ok(())
    }

    /// Assembles one stats record from the live counters.
    pub fn stats(&self) -> StatsRecord {
        let snapshot = self.aggregator.snapshot();
        StatsRecord {
            active: self.shared.active.load(Ordering::Relaxed),
            total_connects: self.shared.total_connects.load(Ordering::Relaxed),
            total_failures: self.shared.total_failures.load(Ordering::Relaxed),
            target: self.shared.target.load(Ordering::Relaxed),
            connect_ms: self.shared.latency.summary(),
            rtp_packets: snapshot.packets,
            rtp_lost: snapshot.lost,
            rtp_bytes: snapshot.bytes,
            bad_clients: self.shared.bad_clients.load(Ordering::Relaxed),
            bad_client_types: self.shared.bad_client_types.lock().unwrap().clone(),
        }
    }

    /// Emits one stats record per tick until `cancel` fires. The caller
    /// formats; the final record after the drain is the caller's job too.
    pub async fn run_stats_surface(
        &self,
        cancel: &CancellationToken,
        mut emit: impl FnMut(StatsRecord),
    ) {
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.stats_interval,
            self.config.stats_interval,
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => emit(self.stats()),
            }
        }
    }
}

/// The adaptive-rate decision over one 10-dispatch window: halve on > 20%
/// failures (floor 1/s), recover by 1.2× toward the configured rate on a
/// clean window.
fn adjusted_rate(current: f64, configured: f64, failure_delta: i64) -> Option<f64> {
    if failure_delta > 2 {
        Some((current / 2.0).max(1.0))
    } else if failure_delta == 0 && current < configured {
        Some((current * 1.2).min(configured))
    } else {
        None
    }
}

/// One real session: bounded connect retries with exponential backoff, then
/// the session until its lifetime or the run ends. Holds its semaphore
/// permit (fixed-target mode) until exit.
pub(crate) async fn session_task(
    config: SessionConfig,
    aggregator: Arc<Aggregator>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    permit: Option<OwnedSemaphorePermit>,
    connect_attempts: u32,
) {
    let _permit = permit;
    let mut backoff = Duration::from_millis(100);
    let mut session = None;
    for attempt in 0..connect_attempts {
        if cancel.is_cancelled() {
            return;
        }
        let start = Instant::now();
        match RtspSession::connect(config.clone(), aggregator.clone()).await {
            Ok(s) => {
                shared.latency.record(start.elapsed());
                session = Some(s);
                break;
            }
            Err(e) => {
                if attempt + 1 == connect_attempts || !e.is_transient() {
                    debug!("connect failed (attempt {}): {e}", attempt + 1);
                    shared.total_failures.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
    let Some(session) = session else { return };

    shared.total_connects.fetch_add(1, Ordering::Relaxed);
    let _active = ActiveGuard::new(&shared);
    if let Err(e) = session.run(&cancel).await {
        if !cancel.is_cancelled() {
            debug!("session failed: {e}");
            shared.total_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// One misbehaving client slot. Contributes to `active`, `bad_clients`, and
/// the per-type tally — never to `total_connects`, latency, or failures.
pub(crate) async fn bad_client_task(
    url: Url,
    lifetime: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    permit: Option<OwnedSemaphorePermit>,
) {
    let _permit = permit;
    let behavior = badclient::random_misbehavior();
    shared.bad_clients.fetch_add(1, Ordering::Relaxed);
    {
        let mut types = shared.bad_client_types.lock().unwrap();
        *types.entry(behavior.name().to_owned()).or_insert(0) += 1;
    }
    let _active = ActiveGuard::new(&shared);

    let deadline = tokio::time::sleep(lifetime);
    tokio::pin!(deadline);
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        _ = deadline.as_mut() => Ok(()),
        r = behavior.run(&url, &cancel) => r,
    };
    if let Err(e) = result {
        debug!("bad client {} ended: {e}", behavior.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockServer, MockServerConfig};

    fn config(server: &MockServer, readers: usize, duration: Duration) -> BenchConfig {
        BenchConfig {
            url: server.url("/test"),
            readers,
            rate: 100.0,
            duration,
            transport: Transport::Tcp,
            stats_interval: Duration::from_secs(5),
            real_world: false,
            avg_connections: 0,
            variance: 0.0,
            bad_clients: false,
            bad_client_ratio: 0.0,
        }
    }

    #[test]
    fn adaptive_rate_decisions() {
        // > 20% failures over the window: halve, floored at 1/s.
        assert_eq!(adjusted_rate(100.0, 100.0, 3), Some(50.0));
        assert_eq!(adjusted_rate(1.5, 100.0, 10), Some(1.0));
        // Clean window below the configured rate: 1.2x, capped.
        assert_eq!(adjusted_rate(50.0, 100.0, 0), Some(60.0));
        assert_eq!(adjusted_rate(90.0, 100.0, 0), Some(100.0));
        // At the configured rate, or mild failures: leave it alone.
        assert_eq!(adjusted_rate(100.0, 100.0, 0), None);
        assert_eq!(adjusted_rate(50.0, 100.0, 1), None);
    }

    #[tokio::test]
    async fn fixed_run_dispatches_and_drains() {
        let server = MockServer::start(MockServerConfig {
            interleaved_frames: 20,
            ..Default::default()
        })
        .await;
        let aggregator = Arc::new(Aggregator::new());
        let runner = Runner::new(
            config(&server, 3, Duration::from_millis(400)),
            aggregator.clone(),
        );
        runner.run(CancellationToken::new()).await.unwrap();

        let stats = runner.stats();
        assert_eq!(stats.total_connects, 3);
        assert_eq!(stats.total_failures, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.rtp_packets, 60);
        assert_eq!(stats.rtp_lost, 0);
        assert_eq!(server.teardowns(), 3);
    }

    #[tokio::test]
    async fn handshake_failures_are_counted() {
        let server = MockServer::start(MockServerConfig {
            describe_status: 500,
            ..Default::default()
        })
        .await;
        let aggregator = Arc::new(Aggregator::new());
        let runner = Runner::new(
            config(&server, 2, Duration::from_millis(200)),
            aggregator,
        );
        runner.run(CancellationToken::new()).await.unwrap();

        let stats = runner.stats();
        assert_eq!(stats.total_connects, 2);
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn cancel_drains_promptly() {
        let server = MockServer::start(MockServerConfig {
            interleaved_frames: 100_000,
            frame_gap: Duration::from_millis(5),
            ..Default::default()
        })
        .await;
        let aggregator = Arc::new(Aggregator::new());
        let runner = Runner::new(
            config(&server, 2, Duration::from_secs(300)),
            aggregator,
        );
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        runner.run(cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        let stats = runner.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_failures, 0);
    }

    #[tokio::test]
    async fn bad_url_is_rejected() {
        let aggregator = Arc::new(Aggregator::new());
        let mut cfg = BenchConfig {
            url: Url::parse("http://example.com/").unwrap(),
            readers: 1,
            rate: 1.0,
            duration: Duration::from_secs(1),
            transport: Transport::Tcp,
            stats_interval: Duration::from_secs(5),
            real_world: false,
            avg_connections: 0,
            variance: 0.0,
            bad_clients: false,
            bad_client_ratio: 0.0,
        };
        let runner = Runner::new(cfg.clone(), aggregator.clone());
        assert!(matches!(
            runner.run(CancellationToken::new()).await,
            Err(Error::InvalidArgument(_))
        ));

        cfg.url = Url::parse("rtsp:/nohost").unwrap();
        let runner = Runner::new(cfg, aggregator);
        assert!(matches!(
            runner.run(CancellationToken::new()).await,
            Err(Error::InvalidArgument(_))
        ));
    }
}
