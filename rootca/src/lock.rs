// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A named, lease-based lock shared by every instance of a deployment.
//!
//! Leases expire so a crashed holder cannot wedge setup forever.

use std::{future::Future, sync::Arc, time::Duration};

use tracing::instrument;

use crate::error::{LockError, StoreError};

/// How often a waiting instance retries the lock.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A backend for named leases.
pub trait LeaseLock: Send + Sync + 'static {
    /// Take the lock `name` for `holder` if it is free, expired, or already held by `holder`.
    ///
    /// Returns whether `holder` now holds the lock.
    fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        lease: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Release the lock if `holder` still holds it.
    fn release(&self, name: &str, holder: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Wait up to `timeout` to take the lock `name`.
///
/// The returned guard should be released with [`LeaseGuard::release`]. If it is dropped
/// instead, the release is spawned onto the current runtime.
///
/// # Errors
///
/// [`LockError::Timeout`] if another holder kept the lock for the whole wait.
#[instrument(skip(lock), err)]
pub async fn acquire<L: LeaseLock>(
    lock: Arc<L>,
    name: &str,
    lease: Duration,
    timeout: Duration,
) -> Result<LeaseGuard<L>, LockError> {
    let holder = uuid::Uuid::new_v4().to_string();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if lock.try_acquire(name, &holder, lease).await? {
            tracing::debug!(name, %holder, "Acquired lock");
            return Ok(LeaseGuard {
                lock,
                name: name.to_string(),
                holder,
                released: false,
            });
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(LockError::Timeout(name.to_string()));
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// A held lease; see [`acquire`].
#[derive(Debug)]
pub struct LeaseGuard<L: LeaseLock> {
    lock: Arc<L>,
    name: String,
    holder: String,
    released: bool,
}

impl<L: LeaseLock> LeaseGuard<L> {
    /// The unique identifier this instance holds the lock under.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release the lock. Failures are logged; the lease expires on its own regardless.
    pub async fn release(mut self) {
        self.released = true;
        match self.lock.release(&self.name, &self.holder).await {
            Ok(()) => tracing::debug!(name = %self.name, holder = %self.holder, "Released lock"),
            Err(error) => {
                tracing::warn!(name = %self.name, ?error, "Failed to release lock; it will expire")
            }
        }
    }
}

impl<L: LeaseLock> Drop for LeaseGuard<L> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = self.lock.clone();
        let name = std::mem::take(&mut self.name);
        let holder = std::mem::take(&mut self.holder);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(error) = lock.release(&name, &holder).await {
                    tracing::warn!(%name, ?error, "Failed to release lock; it will expire");
                }
            });
        } else {
            tracing::warn!(%name, "No runtime available to release lock; it will expire");
        }
    }
}
