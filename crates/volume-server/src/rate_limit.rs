//! Byte-budget admission control for uploads and downloads, realizing the
//! `inFlightUploadDataLimitCond`/`inFlightDownloadDataLimitCond` condition
//! variables as semaphores with a bounded wait instead of blocking forever.

use std::sync::Arc;
use std::time::Duration;

use common::CommonError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct ByteRateLimiter {
    semaphore: Arc<Semaphore>,
    capacity: u32,
    wait: Duration,
}

impl ByteRateLimiter {
    pub fn new(capacity_bytes: usize, wait_ms: u64) -> Self {
        let capacity = capacity_bytes.clamp(1, u32::MAX as usize) as u32;
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            wait: Duration::from_millis(wait_ms),
        }
    }

    /// Reserves `bytes` permits for the lifetime of the returned guard,
    /// giving up with `RateLimited` once the configured wait elapses
    /// rather than queuing indefinitely. Requests larger than the whole
    /// configured budget are clamped to it so they can still complete once
    /// the semaphore fully drains instead of blocking forever.
    pub async fn acquire(&self, bytes: usize) -> Result<OwnedSemaphorePermit, CommonError> {
        let permits = (bytes.clamp(1, u32::MAX as usize) as u32).min(self.capacity);
        match tokio::time::timeout(self.wait, self.semaphore.clone().acquire_many_owned(permits)).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(CommonError::Internal("rate limiter semaphore closed".into())),
            Err(_) => Err(CommonError::RateLimited {
                retry_after_ms: self.wait.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_within_capacity() {
        let limiter = ByteRateLimiter::new(1024, 1000);
        let permit = limiter.acquire(512).await.unwrap();
        drop(permit);
    }

    #[tokio::test]
    async fn times_out_when_capacity_exhausted() {
        let limiter = ByteRateLimiter::new(100, 50);
        let _held = limiter.acquire(100).await.unwrap();
        let err = limiter.acquire(100).await.unwrap_err();
        assert!(matches!(err, CommonError::RateLimited { .. }));
    }
}
