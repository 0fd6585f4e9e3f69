//! Single-flight admission with a global concurrency limit.
//!
//! A token claimed by one call is skipped by every overlapping call until its
//! handler finishes, and a shared semaphore caps how many handlers run at once
//! across all calls. There is no fairness between overlapping calls: one call
//! holding every slot can delay another call's tokens indefinitely.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::context::Context;
use crate::error::{MultiError, Result};
use crate::jobs::join_all;

type Registry = Arc<Mutex<HashSet<String>>>;

/// Runs keyed work at most once concurrently per token.
#[derive(Debug)]
pub struct InflightController {
    registry: Registry,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    calls: watch::Sender<usize>,
}

/// Registry entry owned by one call; removes its token on drop.
struct TokenClaim {
    token: String,
    registry: Registry,
}

impl Drop for TokenClaim {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.token);
    }
}

struct CallGuard<'a> {
    calls: &'a watch::Sender<usize>,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.calls.send_modify(|n| *n -= 1);
    }
}

impl InflightController {
    /// `max_concurrent` below one is raised to one.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (calls, _) = watch::channel(0);
        Self {
            registry: Arc::default(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            calls,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Sorted snapshot of the tokens currently claimed.
    pub fn in_flight(&self) -> Vec<String> {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tokens: Vec<String> = registry.iter().cloned().collect();
        tokens.sort();
        tokens
    }

    /// Claim every token nobody else holds, in one critical section.
    fn claim(&self, tokens: Vec<String>) -> Vec<TokenClaim> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        tokens
            .into_iter()
            .filter(|token| registry.insert(token.clone()))
            .map(|token| TokenClaim {
                token,
                registry: Arc::clone(&self.registry),
            })
            .collect()
    }

    fn enter_call(&self) -> CallGuard<'_> {
        self.calls.send_modify(|n| *n += 1);
        CallGuard { calls: &self.calls }
    }

    /// Run `f` for every token not already being processed by another call.
    ///
    /// Each admitted token waits for a slot of the shared semaphore. If `ctx`
    /// finishes first, the token is released without running `f` so a later
    /// call can pick it up. Handler errors are collected and returned together
    /// once every handler started by this call has finished.
    pub async fn for_each_not_in_flight<F, Fut>(
        &self,
        ctx: &Context,
        tokens: Vec<String>,
        f: F,
    ) -> Result<()>
    where
        F: Fn(Context, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let _call = self.enter_call();

        let requested = tokens.len();
        let claims = self.claim(tokens);
        tracing::debug!(
            requested,
            claimed = claims.len(),
            "Partitioned tokens against in-flight registry"
        );

        let f = Arc::new(f);
        let errs = Arc::new(Mutex::new(MultiError::new()));
        let mut set = JoinSet::new();

        for claim in claims {
            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => tokio::select! {
                    biased;
                    _ = ctx.done() => None,
                    permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
                },
            };
            let Some(permit) = permit else {
                tracing::debug!(token = %claim.token, "Context done before a slot freed up, releasing token");
                continue;
            };
            if ctx.is_done() {
                tracing::debug!(token = %claim.token, "Context done after acquiring a slot, releasing token");
                continue;
            }

            let ctx = ctx.clone();
            let f = Arc::clone(&f);
            let errs = Arc::clone(&errs);
            set.spawn(async move {
                let token = claim.token.clone();
                if let Err(e) = f(ctx, token.clone()).await {
                    errs.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .add(e.context(format!("token {token:?}")));
                }
                drop(claim);
                drop(permit);
            });
        }

        join_all(&mut set).await;

        let errs = std::mem::take(&mut *errs.lock().unwrap_or_else(PoisonError::into_inner));
        errs.into_result()
    }

    /// Resolves once no [`for_each_not_in_flight`](Self::for_each_not_in_flight)
    /// call is executing.
    pub async fn wait(&self) {
        let mut calls = self.calls.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = calls.wait_for(|&n| n == 0).await;
    }
}
