// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The configuration store holding the root authority's persisted material and shared settings.
//!
//! Values are opaque strings keyed by name. They are only ever replaced, never edited in place,
//! so instances may read them concurrently without holding the setup lock.

use std::{
    collections::HashMap,
    future::Future,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::{error::StoreError, lock::LeaseLock, revocation::RevocationLedger};

/// Names of the values kept in the configuration store.
pub mod keys {
    /// PEM-encoded PKCS#8 private key of the root authority.
    pub const ROOT_PRIVATE_KEY: &str = "root.private.key";
    /// PEM-encoded public key of the root authority.
    pub const ROOT_PUBLIC_KEY: &str = "root.public.key";
    /// PEM-encoded self-signed root certificate.
    pub const ROOT_CERTIFICATE: &str = "root.certificate";
    /// Distinguished name used as the root certificate's subject and issuer.
    pub const ROOT_ISSUER_DN: &str = "root.issuer.dn";
    /// "true" to require client certificates during the TLS handshake.
    pub const AUTH_STRICTNESS: &str = "auth.strictness";
    /// "true" to accept expired client certificates during the TLS handshake.
    pub const ALLOW_EXPIRED_CERT: &str = "allow.expired.cert";
}

/// Persisted key/value configuration shared by every instance of a deployment.
pub trait ConfigStore: Send + Sync + 'static {
    /// Get the value stored under `name`, if any.
    fn get(&self, name: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Atomically replace the value stored under `name`.
    fn update(&self, name: &str, value: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// A process-local store, useful for tests and single-instance deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    locks: Mutex<HashMap<String, (String, Instant)>>,
    revoked: Mutex<Vec<(String, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(values.get(name).cloned())
    }

    async fn update(&self, name: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        values.insert(name.to_string(), value.to_string());
        Ok(())
    }
}

impl LeaseLock for MemoryStore {
    async fn try_acquire(&self, name: &str, holder: &str, lease: Duration) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match locks.get(name) {
            Some((current_holder, expires_at)) if current_holder != holder && *expires_at > now => {
                Ok(false)
            }
            _ => {
                locks.insert(name.to_string(), (holder.to_string(), now + lease));
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(name)
            .is_some_and(|(current_holder, _)| current_holder == holder)
        {
            locks.remove(name);
        }
        Ok(())
    }
}

impl RevocationLedger for MemoryStore {
    async fn record_revocation(&self, serial: &str, common_name: &str) -> Result<(), StoreError> {
        if serial.is_empty() && common_name.is_empty() {
            return Err(StoreError::EmptyRevocation);
        }
        let mut revoked = self.revoked.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        revoked.push((serial.to_string(), common_name.to_string()));
        Ok(())
    }

    async fn revocations(&self) -> Result<Vec<(String, String)>, StoreError> {
        let revoked = self.revoked.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(revoked.clone())
    }
}

/// Parse a boolean setting the way it is persisted ("true" or "false", any case).
pub(crate) fn parse_bool(name: &str, value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim) {
        None | Some("") => default,
        Some(value) if value.eq_ignore_ascii_case("true") => true,
        Some(value) if value.eq_ignore_ascii_case("false") => false,
        Some(value) => {
            tracing::warn!(name, value, default, "Ignoring malformed boolean setting");
            default
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A [`MemoryStore`] that fails to read one key until cleared.
    #[derive(Debug, Default)]
    pub(crate) struct UnreadableStore {
        pub inner: MemoryStore,
        pub unreadable: Mutex<Option<&'static str>>,
    }

    impl UnreadableStore {
        pub fn fail_reads_of(&self, name: Option<&'static str>) {
            *self.unreadable.lock().expect("not poisoned") = name;
        }
    }

    impl ConfigStore for UnreadableStore {
        async fn get(&self, name: &str) -> Result<Option<String>, StoreError> {
            let unreadable = self
                .unreadable
                .lock()
                .expect("not poisoned")
                .is_some_and(|key| key == name);
            if unreadable {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.get(name).await
        }

        async fn update(&self, name: &str, value: &str) -> Result<(), StoreError> {
            self.inner.update(name, value).await
        }
    }

    impl LeaseLock for UnreadableStore {
        async fn try_acquire(
            &self,
            name: &str,
            holder: &str,
            lease: Duration,
        ) -> Result<bool, StoreError> {
            self.inner.try_acquire(name, holder, lease).await
        }

        async fn release(&self, name: &str, holder: &str) -> Result<(), StoreError> {
            self.inner.release(name, holder).await
        }
    }

    #[tokio::test]
    async fn update_replaces() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        assert_eq!(store.get(keys::ROOT_ISSUER_DN).await?, None);
        store.update(keys::ROOT_ISSUER_DN, "CN=one").await?;
        store.update(keys::ROOT_ISSUER_DN, "CN=two").await?;
        assert_eq!(
            store.get(keys::ROOT_ISSUER_DN).await?.as_deref(),
            Some("CN=two")
        );
        Ok(())
    }

    #[tokio::test]
    async fn lease_excludes_other_holders() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let lease = Duration::from_secs(60);
        assert!(store.try_acquire("setup", "a", lease).await?);
        assert!(!store.try_acquire("setup", "b", lease).await?);
        // Re-acquiring extends the lease for the current holder.
        assert!(store.try_acquire("setup", "a", lease).await?);

        // Only the holder can release it.
        store.release("setup", "b").await?;
        assert!(!store.try_acquire("setup", "b", lease).await?);
        store.release("setup", "a").await?;
        assert!(store.try_acquire("setup", "b", lease).await?);
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        assert!(store.try_acquire("setup", "a", Duration::ZERO).await?);
        assert!(store.try_acquire("setup", "b", Duration::from_secs(60)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn revocation_needs_an_identifier() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        assert!(matches!(
            store.record_revocation("", "").await,
            Err(StoreError::EmptyRevocation)
        ));
        store.record_revocation("", "stolen.example").await?;
        assert_eq!(
            store.revocations().await?,
            [(String::new(), "stolen.example".to_string())]
        );
        Ok(())
    }

    #[test]
    fn booleans() {
        assert!(parse_bool("x", Some("TRUE".into()), false));
        assert!(!parse_bool("x", Some(" false ".into()), true));
        assert!(parse_bool("x", None, true));
        assert!(!parse_bool("x", Some("yes".into()), false));
    }
}
