// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! CLI for the RTSP load generator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;
use url::Url;

use rtsp_bench::bench::{BenchConfig, Runner, StatsRecord};
use rtsp_bench::rtp::Aggregator;
use rtsp_bench::Transport;

/// High-concurrency RTSP load generator.
#[derive(Parser)]
#[command(name = "rtsp-bench", version, about)]
struct Opts {
    /// rtsp:// URL to stream from.
    #[arg(long)]
    url: Url,

    /// Total sessions to establish (fixed-target mode).
    #[arg(long, default_value_t = 10)]
    readers: usize,

    /// Session dispatch rate, per second.
    #[arg(long, default_value_t = 2.0)]
    rate: f64,

    /// Per-session lifetime, in seconds.
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Media transport: tcp (interleaved) or udp.
    #[arg(long, default_value = "tcp")]
    transport: Transport,

    /// Seconds between stats records.
    #[arg(long, default_value_t = 5)]
    stats_interval: u64,

    /// Stats output format: text or json.
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    /// Chase a realistic time-varying target instead of a fixed count.
    #[arg(long)]
    real_world: bool,

    /// Real-world mode: average concurrent sessions.
    #[arg(long, default_value_t = 500)]
    avg_connections: usize,

    /// Real-world mode: load variance (0.0-1.0).
    #[arg(long, default_value_t = 0.3)]
    variance: f64,

    /// Mix in misbehaving clients.
    #[arg(long)]
    bad_clients: bool,

    /// Fraction of slots given to misbehaving clients (0.0-1.0).
    #[arg(long, default_value_t = 0.1)]
    bad_client_ratio: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("log format {s:?} not understood (expected text or json)")),
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = main_inner().await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn main_inner() -> Result<(), anyhow::Error> {
    let opts = Opts::parse();
    let config = BenchConfig {
        url: opts.url.clone(),
        readers: opts.readers,
        rate: opts.rate,
        duration: Duration::from_secs(opts.duration),
        transport: opts.transport,
        stats_interval: Duration::from_secs(opts.stats_interval),
        real_world: opts.real_world,
        avg_connections: opts.avg_connections,
        variance: opts.variance,
        bad_clients: opts.bad_clients,
        bad_client_ratio: opts.bad_client_ratio,
    };
    let aggregator = Arc::new(Aggregator::new());
    let runner = Arc::new(Runner::new(config, aggregator));
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            signal_cancel.cancel();
        }
    });

    let start = Instant::now();
    let surface_runner = runner.clone();
    let surface_cancel = cancel.clone();
    let format = opts.log_format;
    let surface = tokio::spawn(async move {
        surface_runner
            .run_stats_surface(&surface_cancel, |record| {
                emit(format, &record, start.elapsed());
            })
            .await;
    });

    let result = runner.run(cancel.clone()).await;
    cancel.cancel();
    let _ = surface.await;

    // Final record after the drain.
    emit(opts.log_format, &runner.stats(), start.elapsed());
    result.map_err(Into::into)
}

fn emit(format: LogFormat, record: &StatsRecord, elapsed: Duration) {
    match format {
        LogFormat::Json => match serde_json::to_string(record) {
            Ok(line) => println!("{line}"),
            Err(e) => error!("stats serialization failed: {e}"),
        },
        LogFormat::Text => {
            let target = if record.target > 0 {
                format!(" | Target: {}", record.target)
            } else {
                String::new()
            };
            let bad = if record.bad_clients > 0 {
                format!(" | Bad: {}", record.bad_clients)
            } else {
                String::new()
            };
            println!(
                "Active: {}{target} | Total: {} | Failed: {}{bad} | \
                 Avg Connect: {:.1}ms (p95 {:.1}ms) | Packets: {} | Loss: {:.2}% | {:.2} Mbps",
                record.active,
                record.total_connects,
                record.total_failures,
                record.connect_ms.avg,
                record.connect_ms.p95,
                record.rtp_packets,
                record.loss_rate() * 100.0,
                record.bitrate_mbps(elapsed.as_secs_f64()),
            );
        }
    }
}
