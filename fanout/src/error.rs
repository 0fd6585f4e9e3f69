//! Error taxonomy for the toolkit.
//!
//! Job errors are opaque `anyhow::Error` values returned by caller closures.
//! Cancellation surfaces as [`ContextError`]. Fail-continue operations fold
//! every failure into a [`MultiError`].

use std::fmt;

use thiserror::Error;

/// Why a [`Context`](crate::Context) is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Error)]
pub enum Error {
    /// First error returned by a job closure.
    #[error(transparent)]
    Job(anyhow::Error),

    #[error(transparent)]
    Context(#[from] ContextError),

    /// Every failure of a fail-continue operation.
    #[error(transparent)]
    Multiple(MultiError),
}

impl Error {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Context(_))
    }

    /// Underlying job errors: one for `Job`, all of them for `Multiple`.
    pub fn job_errors(&self) -> Vec<&anyhow::Error> {
        match self {
            Self::Job(e) => vec![e],
            Self::Multiple(m) => m.errors().iter().collect(),
            Self::Context(_) => Vec::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Append-only collection of errors with a stable rendering.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, err: anyhow::Error) {
        self.errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }

    /// `Ok(())` when nothing was added, otherwise the aggregate.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Multiple(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => f.write_str("no errors"),
            [only] => write!(f, "{only:#}"),
            errors => {
                write!(f, "{} errors occurred: ", errors.len())?;
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{e:#}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

impl FromIterator<anyhow::Error> for MultiError {
    fn from_iter<I: IntoIterator<Item = anyhow::Error>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}
