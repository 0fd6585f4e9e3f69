//! Bounded-parallelism job runner.
//!
//! Workers pull job indices off a shared atomic cursor, so at most
//! `concurrency` closures run at once and every index is claimed exactly
//! once per call. Three flavours:
//! - [`run_jobs`]: fail-fast, returns the first error.
//! - [`run_for_keys`]: fail-continue, attempts every key and aggregates errors.
//! - [`run_jobs_collect`]: fail-fast, concatenates per-job result vectors.
//!
//! Panics inside a closure are not recovered: they are re-raised on the
//! calling task once the worker that panicked is joined.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;

use crate::context::Context;
use crate::error::{Error, MultiError, Result};

/// Number of workers for `jobs` units of work; `0` means one per job.
fn worker_count(concurrency: usize, jobs: usize) -> usize {
    if concurrency == 0 {
        jobs
    } else {
        concurrency.min(jobs)
    }
}

/// Drain a join set, re-raising any worker panic on the current task.
pub(crate) async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined
            && e.is_panic()
        {
            std::panic::resume_unwind(e.into_panic());
        }
    }
}

/// Run `f` for every index in `[0, total_jobs)` with at most `concurrency`
/// in flight.
///
/// The first error cancels the context shared by the workers, so no new
/// index is dispatched after it; closures already running finish normally.
/// Returns that first error, the context error if the caller's context was
/// canceled, or `Ok(())`.
///
/// The context passed to `f` is always canceled by the time this returns.
pub async fn run_jobs<F, Fut>(
    ctx: &Context,
    total_jobs: usize,
    concurrency: usize,
    f: F,
) -> Result<()>
where
    F: Fn(Context, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    if total_jobs == 0 {
        return Ok(());
    }

    let ctx = ctx.child();
    let _cancel = ctx.drop_guard();

    if total_jobs == 1 {
        return f(ctx.clone(), 0).await.map_err(Error::Job);
    }

    let workers = worker_count(concurrency, total_jobs);
    tracing::debug!(jobs = total_jobs, workers, "Dispatching jobs");

    let cursor = Arc::new(AtomicUsize::new(0));
    let first_err: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let f = Arc::new(f);

    let mut set = JoinSet::new();
    for _ in 0..workers {
        let ctx = ctx.clone();
        let cursor = Arc::clone(&cursor);
        let first_err = Arc::clone(&first_err);
        let f = Arc::clone(&f);

        set.spawn(async move {
            let outcome = loop {
                if let Some(cause) = ctx.err() {
                    break Err(Error::from(cause));
                }
                let idx = cursor.fetch_add(1, Ordering::Relaxed);
                if idx >= total_jobs {
                    break Ok(());
                }
                if let Err(e) = f(ctx.clone(), idx).await {
                    tracing::debug!(job = idx, error = %e, "Job failed, stopping dispatch");
                    break Err(Error::Job(e));
                }
            };

            if let Err(err) = outcome {
                let mut slot = first_err.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    *slot = Some(err);
                }
                drop(slot);
                ctx.cancel();
            }
        });
    }

    join_all(&mut set).await;

    let mut slot = first_err.lock().unwrap_or_else(PoisonError::into_inner);
    match slot.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Run `f` once for every key with at most `concurrency` in flight, even
/// when some keys fail.
///
/// Errors are annotated with their key and returned together once every
/// worker has finished. If `ctx` is done, keys not yet dispatched are
/// skipped; closures already running are not interrupted.
pub async fn run_for_keys<F, Fut>(
    ctx: &Context,
    keys: Vec<String>,
    concurrency: usize,
    f: F,
) -> Result<()>
where
    F: Fn(Context, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    if keys.is_empty() {
        return Ok(());
    }

    let workers = worker_count(concurrency, keys.len());
    tracing::debug!(keys = keys.len(), workers, "Dispatching keyed jobs");

    let keys: Arc<[String]> = keys.into();
    let cursor = Arc::new(AtomicUsize::new(0));
    let errs = Arc::new(Mutex::new(MultiError::new()));
    let f = Arc::new(f);

    let mut set = JoinSet::new();
    for _ in 0..workers {
        let ctx = ctx.clone();
        let keys = Arc::clone(&keys);
        let cursor = Arc::clone(&cursor);
        let errs = Arc::clone(&errs);
        let f = Arc::clone(&f);

        set.spawn(async move {
            loop {
                let idx = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(key) = keys.get(idx) else {
                    break;
                };
                if ctx.is_done() {
                    tracing::debug!(
                        skipped = keys.len() - idx,
                        "Context done, skipping remaining keys"
                    );
                    break;
                }
                if let Err(e) = f(ctx.clone(), key.clone()).await {
                    errs.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .add(e.context(format!("key {key:?}")));
                }
            }
        });
    }

    join_all(&mut set).await;

    let errs = std::mem::take(&mut *errs.lock().unwrap_or_else(PoisonError::into_inner));
    if !errs.is_empty() {
        tracing::debug!(failed = errs.len(), "Keyed jobs finished with errors");
    }
    errs.into_result()
}

/// Fail-fast runner that merges the results of every job.
///
/// Results from each job are appended in completion order. On the first error
/// the partial results are discarded and only the error is returned.
pub async fn run_jobs_collect<J, R, F, Fut>(
    ctx: &Context,
    items: Vec<J>,
    concurrency: usize,
    f: F,
) -> Result<Vec<R>>
where
    J: Clone + Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(Context, J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<R>>> + Send + 'static,
{
    let items: Arc<[J]> = items.into();
    let total = items.len();
    let results: Arc<Mutex<Vec<R>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&results);
    run_jobs(ctx, total, concurrency, move |ctx, idx| {
        let job = f(ctx, items[idx].clone());
        let sink = Arc::clone(&sink);
        async move {
            let batch = job.await?;
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(batch);
            anyhow::Ok(())
        }
    })
    .await?;

    let merged = std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));
    Ok(merged)
}
