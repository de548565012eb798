// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Real-world load controller.
//!
//! Instead of dispatching a fixed number of sessions, this chases a
//! time-varying target: every 10 s the target is recomputed from an
//! hour-of-day factor and bounded random variance; every 1 s the controller
//! adds (up to 50) or cancels (up to 20) sessions to track it. Session
//! lifetimes are themselves randomized so churn arises naturally, not only
//! from controller cancellation.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Timelike;
use log::info;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{bad_client_task, session_task, BenchConfig, Shared};
use crate::client::SessionConfig;
use crate::rtp::Aggregator;
use crate::Error;

/// How often the target is re-evaluated.
const ADJUST_INTERVAL: Duration = Duration::from_secs(10);

/// How often active sessions are reconciled against the target.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// Step limits per reconcile tick.
const MAX_ADD: i64 = 50;
const MAX_REMOVE: i64 = 20;

/// Minimum randomized session lifetime.
const MIN_LIFETIME: Duration = Duration::from_secs(30);

/// Fallback maximum when the configured duration is no longer than
/// [`MIN_LIFETIME`].
const FALLBACK_MAX_LIFETIME: Duration = Duration::from_secs(300);

pub(crate) struct RealWorldController {
    config: BenchConfig,
    aggregator: Arc<Aggregator>,
    shared: Arc<Shared>,
    /// Cancel handles of everything this controller spawned, keyed by a
    /// process-unique id. Iteration order is the "arbitrary" pick when
    /// scaling down.
    sessions: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    next_id: u64,
    tracker: TaskTracker,
}

impl RealWorldController {
    pub(crate) fn new(
        config: BenchConfig,
        aggregator: Arc<Aggregator>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            config,
            aggregator,
            shared,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: 0,
            tracker: TaskTracker::new(),
        }
    }

    pub(crate) async fn run(mut self, cancel: CancellationToken) -> Result<(), Error> {
        info!(
            "starting real-world simulation: avg {} connections, ±{:.0}% variance",
            self.config.avg_connections,
            self.config.variance * 100.0
        );
        self.shared
            .target
            .store(self.config.avg_connections as i64, Ordering::Relaxed);

        let now = tokio::time::Instant::now();
        let mut adjust = tokio::time::interval_at(now + ADJUST_INTERVAL, ADJUST_INTERVAL);
        let mut reconcile = tokio::time::interval_at(now + RECONCILE_INTERVAL, RECONCILE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = adjust.tick() => self.adjust_target(),
                _ = reconcile.tick() => self.reconcile(&cancel),
            }
        }

        info!("shutting down simulation");
        for (_, token) in self.sessions.lock().unwrap().drain() {
            token.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }

    fn adjust_target(&self) {
        let hour = chrono::Local::now().hour();
        let target = compute_target(
            self.config.avg_connections as f64,
            self.config.variance,
            hour,
            rand::thread_rng().gen(),
        );
        self.shared.target.store(target, Ordering::Relaxed);
        info!(
            "load adjustment: target={target} active={}",
            self.shared.active.load(Ordering::Relaxed)
        );
    }

    fn reconcile(&mut self, cancel: &CancellationToken) {
        let active = self.shared.active.load(Ordering::Relaxed);
        let target = self.shared.target.load(Ordering::Relaxed);
        let diff = target - active;
        if diff > 0 {
            for _ in 0..diff.min(MAX_ADD) {
                self.spawn_slot(cancel);
            }
        } else if diff < 0 {
            let mut sessions = self.sessions.lock().unwrap();
            let victims: Vec<u64> = sessions
                .keys()
                .copied()
                .take((-diff).min(MAX_REMOVE) as usize)
                .collect();
            for id in victims {
                if let Some(token) = sessions.remove(&id) {
                    token.cancel();
                }
            }
        }
    }

    /// Spawns one slot: usually a real session, occasionally (per the
    /// configured ratio) a misbehaving client.
    fn spawn_slot(&mut self, cancel: &CancellationToken) {
        let id = self.next_id;
        self.next_id += 1;
        let token = cancel.child_token();
        self.sessions.lock().unwrap().insert(id, token.clone());
        let sessions = Arc::clone(&self.sessions);
        let shared = self.shared.clone();
        let lifetime = random_lifetime(self.config.duration);

        let bad = self.config.bad_clients
            && rand::thread_rng().gen_bool(self.config.bad_client_ratio);
        if bad {
            let url = self.config.url.clone();
            self.tracker.spawn(async move {
                bad_client_task(url, lifetime, shared, token, None).await;
                sessions.lock().unwrap().remove(&id);
            });
        } else {
            let session_config = SessionConfig {
                url: self.config.url.clone(),
                transport: self.config.transport,
                lifetime,
            };
            let aggregator = self.aggregator.clone();
            self.tracker.spawn(async move {
                session_task(session_config, aggregator, shared, token, None, 1).await;
                sessions.lock().unwrap().remove(&id);
            });
        }
    }
}

/// Hour-of-day load factor: morning and evening peaks, lunch dip, night low.
fn day_factor(hour: u32) -> f64 {
    match hour {
        9..=11 => 1.2,
        12..=13 => 0.9,
        14..=17 => 1.1,
        18..=22 => 1.3,
        23 | 0..=5 => 0.6,
        _ => 0.8,
    }
}

/// `avg × day_factor × (1 + (random − 0.5) × variance)`, clamped to
/// `avg × [1 − variance, 1 + variance]`. `random` is uniform in `[0, 1)`.
fn compute_target(avg: f64, variance: f64, hour: u32, random: f64) -> i64 {
    let random_factor = 1.0 + (random - 0.5) * variance;
    let target = avg * day_factor(hour) * random_factor;
    target.clamp(avg * (1.0 - variance), avg * (1.0 + variance)) as i64
}

/// Uniform in `[30 s, max]`; when the configured duration is not longer than
/// 30 s, the upper bound falls back to 5 min.
fn random_lifetime(max: Duration) -> Duration {
    let max = if max <= MIN_LIFETIME {
        FALLBACK_MAX_LIFETIME
    } else {
        max
    };
    MIN_LIFETIME + (max - MIN_LIFETIME).mul_f64(rand::thread_rng().gen())
}
