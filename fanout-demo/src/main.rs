//! fanout-demo: run a synthetic tenant health sweep through every fanout
//! primitive and print a JSON report.

use std::collections::HashMap;
use std::process;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use fanout::{Context, InflightController, Limits, WorkerPool, run_for_keys, run_jobs_collect};

struct Options {
    tenants: usize,
    concurrency: Option<usize>,
    fail_every: usize,
    timeout: Duration,
}

#[derive(Debug)]
struct Latency {
    tenant: String,
    micros: u64,
}

#[derive(Debug, Serialize)]
struct Report {
    limits: Limits,
    tenants: usize,
    health_failures: Vec<String>,
    latency_p50_us: u64,
    latency_max_us: u64,
    refreshes: usize,
    persistent_workers: usize,
}

/// Initialize tracing with FANOUT_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("FANOUT_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("fanout={level},fanout_demo={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: fanout-demo [--tenants N] [--concurrency C] [--fail-every K] [--timeout-ms T]"
            );
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --tenants <n>        Number of synthetic tenants [default: 32]");
            eprintln!("  --concurrency <c>    Workers per sweep [default: FANOUT_CONCURRENCY]");
            eprintln!("  --fail-every <k>     Fail the health check of every k-th tenant [default: 0]");
            eprintln!("  --timeout-ms <t>     Deadline for the whole run [default: 5000]");
            process::exit(2);
        }
    };

    match run(opts).await {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("error: JSON serialization failed: {e}");
                process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options {
        tenants: 32,
        concurrency: None,
        fail_every: 0,
        timeout: Duration::from_millis(5000),
    };

    let value = |i: usize, flag: &str| -> Result<usize, String> {
        let raw = args.get(i).ok_or(format!("{flag} requires a value"))?;
        raw.parse()
            .map_err(|_| format!("{flag} expects a non-negative integer, got '{raw}'"))
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--tenants" => {
                i += 1;
                opts.tenants = value(i, "--tenants")?;
            }
            "--concurrency" => {
                i += 1;
                opts.concurrency = Some(value(i, "--concurrency")?);
            }
            "--fail-every" => {
                i += 1;
                opts.fail_every = value(i, "--fail-every")?;
            }
            "--timeout-ms" => {
                i += 1;
                opts.timeout = Duration::from_millis(value(i, "--timeout-ms")? as u64);
            }
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    Ok(opts)
}

fn tenant_index(tenant: &str) -> usize {
    tenant
        .rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Simulated per-tenant health check: a short, tenant-dependent delay.
async fn probe(ctx: &Context, tenant: &str, fail_every: usize) -> anyhow::Result<()> {
    let idx = tenant_index(tenant);
    let delay = Duration::from_millis((idx % 7) as u64 + 1);

    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = ctx.done() => anyhow::bail!("probe interrupted"),
    }

    if fail_every > 0 && idx % fail_every == 0 {
        anyhow::bail!("health endpoint returned 503");
    }
    Ok(())
}

async fn run(opts: Options) -> anyhow::Result<Report> {
    let mut limits = Limits::from_env();
    if let Some(concurrency) = opts.concurrency {
        limits = limits.with_concurrency(concurrency);
    }
    tracing::info!(tenants = opts.tenants, ?limits, "Starting sweep");

    let ctx = Context::background().with_timeout(opts.timeout);
    let tenants: Vec<String> = (0..opts.tenants).map(|i| format!("tenant-{i:03}")).collect();
    let fail_every = opts.fail_every;

    // Health: every tenant is checked, failures are reported rather than fatal.
    let health = run_for_keys(
        &ctx,
        tenants.clone(),
        limits.concurrency,
        move |ctx, tenant| async move { probe(&ctx, &tenant, fail_every).await },
    )
    .await;
    if let Some(cause) = ctx.err() {
        return Err(anyhow::Error::new(cause).context("health sweep did not finish"));
    }
    let health_failures = match health {
        Ok(()) => Vec::new(),
        Err(e) => {
            let mut failures: Vec<String> =
                e.job_errors().iter().map(|e| format!("{e:#}")).collect();
            failures.sort();
            failures
        }
    };
    tracing::info!(failed = health_failures.len(), "Health sweep finished");

    // Latency: fail-fast, merged into one list.
    let mut latencies = run_jobs_collect(
        &ctx,
        tenants.clone(),
        limits.concurrency,
        |ctx, tenant| async move {
            let started = Instant::now();
            probe(&ctx, &tenant, 0).await?;
            let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
            anyhow::Ok(vec![Latency { tenant, micros }])
        },
    )
    .await?;
    latencies.sort_by_key(|l| l.micros);
    if let Some(slowest) = latencies.last() {
        tracing::debug!(tenant = %slowest.tenant, micros = slowest.micros, "Slowest tenant");
    }

    // Refresh: two overlapping single-flight rounds over overlapping halves.
    let controller = Arc::new(InflightController::new(limits.max_in_flight));
    let refreshed: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
    let half = tenants.len() / 2;
    let rounds = [
        tenants[..tenants.len().min(half + 1)].to_vec(),
        tenants[half..].to_vec(),
    ];

    let mut handles = Vec::new();
    for round in rounds {
        let controller = Arc::clone(&controller);
        let refreshed = Arc::clone(&refreshed);
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            controller
                .for_each_not_in_flight(&ctx, round, move |ctx, tenant| {
                    let refreshed = Arc::clone(&refreshed);
                    async move {
                        probe(&ctx, &tenant, 0).await?;
                        *refreshed
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .entry(tenant)
                            .or_default() += 1;
                        anyhow::Ok(())
                    }
                })
                .await
        }));
    }
    for handle in handles {
        handle.await??;
    }
    controller.wait().await;
    let refreshes: usize = refreshed
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .sum();

    // Report lines are formatted off the async runtime.
    let pool = WorkerPool::new(limits.pool_size);
    let (line_tx, line_rx) = mpsc::channel();
    for failure in health_failures.iter().cloned() {
        let line_tx = line_tx.clone();
        pool.go(move || {
            let _ = line_tx.send(format!("unhealthy: {failure}"));
        });
    }
    drop(line_tx);
    let lines: Vec<String> = tokio::task::spawn_blocking(move || line_rx.iter().collect()).await?;
    for line in &lines {
        tracing::warn!("{line}");
    }
    let persistent_workers = pool.persistent_workers();
    pool.close();

    Ok(Report {
        limits,
        tenants: opts.tenants,
        latency_p50_us: latencies.get(latencies.len() / 2).map_or(0, |l| l.micros),
        latency_max_us: latencies.last().map_or(0, |l| l.micros),
        health_failures,
        refreshes,
        persistent_workers,
    })
}
