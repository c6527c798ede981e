//! Caller-supplied deadlines for operations that reach the object store.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Result, StoreError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline; the operation runs until it finishes.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn is_expired(&self) -> bool {
        self.0.map_or(false, |at| Instant::now() >= at)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Run `fut` to completion or fail with `DeadlineExceeded` naming `op`.
    pub async fn run<T, F>(self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.0 {
            None => fut.await,
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| StoreError::DeadlineExceeded(op.to_string()))?,
        }
    }
}
