// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Revocation lookups consulted during the TLS handshake.

use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, RwLock},
};

use tracing::instrument;

use crate::error::StoreError;

/// A source of revoked certificates.
///
/// Lookups happen inside the TLS verify callback, so they must not block on I/O.
pub trait RevocationStore: Send + Sync {
    /// Whether the certificate with `serial` (upper-case hexadecimal) or `common_name` is revoked.
    fn is_revoked(&self, serial: &str, common_name: Option<&str>) -> bool;
}

/// Persisted record of revocations, shared by every instance of a deployment.
pub trait RevocationLedger: Send + Sync + 'static {
    /// Record a revocation. At least one of `serial` and `common_name` must be non-empty.
    fn record_revocation(
        &self,
        serial: &str,
        common_name: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Every recorded revocation as (serial, common name) pairs.
    fn revocations(&self) -> impl Future<Output = Result<Vec<(String, String)>, StoreError>> + Send;
}

/// Replace the contents of `list` with everything recorded in `ledger`.
#[instrument(skip_all, err)]
pub async fn refresh<L: RevocationLedger>(ledger: &L, list: &RevocationList) -> Result<(), StoreError> {
    let revoked = ledger.revocations().await?;
    tracing::debug!(count = revoked.len(), "Loaded revoked certificates");
    list.replace(revoked);
    Ok(())
}

/// An in-memory set of revoked serial numbers and common names.
///
/// Clones share the same set, so a background task can refresh it from the database while
/// handshakes read it.
#[derive(Debug, Clone, Default)]
pub struct RevocationList {
    entries: Arc<RwLock<Entries>>,
}

#[derive(Debug, Default)]
struct Entries {
    serials: HashSet<String>,
    common_names: HashSet<String>,
}

impl RevocationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revoke by serial number, by common name, or both.
    ///
    /// Empty values are ignored.
    pub fn revoke(&self, serial: &str, common_name: &str) {
        let serial = normalize_serial(serial);
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !serial.is_empty() {
            entries.serials.insert(serial);
        }
        if !common_name.is_empty() {
            entries.common_names.insert(common_name.to_string());
        }
    }

    /// Replace the contents of the list with `revoked`, a set of (serial, common name) pairs.
    pub fn replace<I, S, C>(&self, revoked: I)
    where
        I: IntoIterator<Item = (S, C)>,
        S: AsRef<str>,
        C: AsRef<str>,
    {
        let mut fresh = Entries::default();
        for (serial, common_name) in revoked {
            let serial = normalize_serial(serial.as_ref());
            if !serial.is_empty() {
                fresh.serials.insert(serial);
            }
            if !common_name.as_ref().is_empty() {
                fresh.common_names.insert(common_name.as_ref().to_string());
            }
        }
        *self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
    }

    pub fn len(&self) -> usize {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.serials.len() + entries.common_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RevocationStore for RevocationList {
    fn is_revoked(&self, serial: &str, common_name: Option<&str>) -> bool {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.serials.contains(&normalize_serial(serial))
            || common_name.is_some_and(|name| entries.common_names.contains(name))
    }
}

/// Normalize a serial number to upper-case hexadecimal without a prefix or leading zeros.
///
/// This matches how OpenSSL renders serial numbers, so serials copied out of `openssl x509
/// -serial` or the issuance output compare equal.
pub fn normalize_serial(serial: &str) -> String {
    let serial = serial.trim();
    let serial = serial
        .strip_prefix("0x")
        .or_else(|| serial.strip_prefix("0X"))
        .unwrap_or(serial);
    let serial: String = serial
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let trimmed = serial.trim_start_matches('0');
    if trimmed.is_empty() && !serial.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
