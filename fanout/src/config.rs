//! Concurrency limits with environment overrides.
//!
//! - `FANOUT_CONCURRENCY`: job runner workers per call
//! - `FANOUT_MAX_IN_FLIGHT`: single-flight handler slots
//! - `FANOUT_POOL_SIZE`: persistent worker budget
//!
//! Missing or unparsable values fall back to the defaults.

use std::num::NonZeroUsize;

use serde::Serialize;

const DEFAULT_MAX_IN_FLIGHT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Limits {
    pub concurrency: usize,
    pub max_in_flight: usize,
    pub pool_size: usize,
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl Default for Limits {
    fn default() -> Self {
        Self::from_lookup(env_usize)
    }
}

impl Limits {
    pub fn from_env() -> Self {
        Self::default()
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<usize>) -> Self {
        Self {
            concurrency: lookup("FANOUT_CONCURRENCY").unwrap_or_else(available_parallelism),
            max_in_flight: lookup("FANOUT_MAX_IN_FLIGHT").unwrap_or(DEFAULT_MAX_IN_FLIGHT),
            pool_size: lookup("FANOUT_POOL_SIZE").unwrap_or_else(available_parallelism),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_overrides_defaults() {
        let limits = Limits::from_lookup(|name| match name {
            "FANOUT_CONCURRENCY" => Some(3),
            "FANOUT_POOL_SIZE" => Some(0),
            _ => None,
        });
        assert_eq!(limits.concurrency, 3);
        assert_eq!(limits.pool_size, 0);
        assert_eq!(limits.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
    }

    #[test]
    fn defaults_use_available_parallelism() {
        let limits = Limits::from_lookup(|_| None);
        assert!(limits.concurrency >= 1);
        assert_eq!(limits.concurrency, limits.pool_size);
    }

    #[test]
    fn builder_setters() {
        let limits = Limits::from_lookup(|_| None)
            .with_concurrency(2)
            .with_max_in_flight(5)
            .with_pool_size(7);
        assert_eq!(
            limits,
            Limits {
                concurrency: 2,
                max_in_flight: 5,
                pool_size: 7,
            }
        );
        insta::assert_json_snapshot!(limits, @r#"
        {
          "concurrency": 2,
          "max_in_flight": 5,
          "pool_size": 7
        }
        "#);
    }
}
