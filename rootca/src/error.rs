// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the certificate authority, the trust evaluator, and the setup lock.

/// Errors returned by certificate authority operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CaError {
    /// Persisted material or settings are missing or malformed, or a request is missing
    /// required attributes.
    ///
    /// This is not transient; retrying without changing the configuration will not help.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An OpenSSL operation failed while generating keys, signing, or parsing.
    ///
    /// The underlying error stack is attached. These are not retried automatically.
    #[error("cryptographic operation failed ({context}): {source}")]
    Crypto {
        context: &'static str,
        #[source]
        source: openssl::error::ErrorStack,
    },

    /// The certificate signing request could not be decoded or is not acceptable.
    #[error("invalid certificate signing request: {0}")]
    InvalidRequest(String),

    /// The root authority has not been set up yet.
    ///
    /// Handshakes and issuance requests that arrive before setup completes fail with this
    /// error instead of waiting for the setup lock.
    #[error("the certificate authority is not ready")]
    NotReady,

    /// A TLS session could not be assembled from the management bundle.
    #[error("failed to set up the TLS engine: {0}")]
    TlsSetup(#[source] openssl::error::ErrorStack),

    /// Bootstrap could not produce usable material at the given stage.
    #[error("certificate authority setup failed at stage '{stage}'")]
    SetupFailed { stage: &'static str },

    /// The configuration store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CaError {
    /// Helper to wrap an OpenSSL error stack with a short description of what was attempted.
    pub(crate) fn crypto(context: &'static str) -> impl FnOnce(openssl::error::ErrorStack) -> Self {
        move |source| CaError::Crypto { context, source }
    }
}

/// Reasons a peer certificate is rejected during the TLS handshake.
///
/// A rejection fails the one connection it applies to; it never affects the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TrustRejected {
    /// Strict client authentication is enabled and the peer sent no certificate.
    #[error("a client certificate is required for {0}")]
    MissingCertificate(String),

    /// The certificate was not issued by the root authority.
    #[error("certificate '{subject}' was not issued by the root authority")]
    UntrustedIssuer { subject: String },

    /// The certificate has expired or is not yet valid, and the policy does not tolerate
    /// either.
    #[error("certificate with serial {serial} is outside its validity window")]
    OutsideValidity { serial: String },

    /// The revocation store lists the certificate.
    #[error("certificate with serial {serial} has been revoked")]
    Revoked { serial: String },

    /// The certificate does not name the address the connection came from.
    #[error("certificate ownership verification failed for {remote_address}")]
    AddressMismatch { remote_address: String },

    /// The certificate could not be inspected.
    #[error("failed to inspect the peer certificate: {0}")]
    Malformed(String),
}

/// Errors from the configuration store and revocation store backends.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The database failed; this may be transient (e.g. the database is locked).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A revocation named neither a serial number nor a common name.
    #[error("a revocation must name a serial number or a common name")]
    EmptyRevocation,

    /// Database migrations could not be applied.
    #[error("database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Errors acquiring the named setup lock.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LockError {
    /// The lock was held by another instance for the whole wait.
    ///
    /// This is a soft failure: callers fall back to loading already-persisted material.
    #[error("timed out waiting for lock '{0}'")]
    Timeout(String),

    /// The lock backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
