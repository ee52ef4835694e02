// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Trust decisions for client certificates presented during the TLS handshake.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex},
};

use openssl::{
    asn1::Asn1Time,
    ssl::SslVerifyMode,
    x509::{X509Ref, X509StoreContextRef, X509},
};

use crate::{
    crypto,
    error::{CaError, TrustRejected},
    revocation::RevocationStore,
    store::{keys, parse_bool, ConfigStore},
};

/// The deployment-wide client authentication policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustPolicy {
    /// Require a client certificate.
    pub strict: bool,
    /// Accept client certificates outside their validity window.
    pub allow_expired: bool,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            strict: false,
            allow_expired: true,
        }
    }
}

impl TrustPolicy {
    /// Read the policy from the configuration store, using the defaults for missing values.
    pub async fn load<S: ConfigStore>(store: &S) -> Result<Self, CaError> {
        let defaults = Self::default();
        let strict = parse_bool(
            keys::AUTH_STRICTNESS,
            store.get(keys::AUTH_STRICTNESS).await?,
            defaults.strict,
        );
        let allow_expired = parse_bool(
            keys::ALLOW_EXPIRED_CERT,
            store.get(keys::ALLOW_EXPIRED_CERT).await?,
            defaults.allow_expired,
        );
        Ok(Self {
            strict,
            allow_expired,
        })
    }

    /// Persist the policy to the configuration store.
    pub async fn store<S: ConfigStore>(&self, store: &S) -> Result<(), CaError> {
        store
            .update(keys::AUTH_STRICTNESS, &self.strict.to_string())
            .await?;
        store
            .update(keys::ALLOW_EXPIRED_CERT, &self.allow_expired.to_string())
            .await?;
        Ok(())
    }

    /// The OpenSSL verification mode for this policy.
    pub fn verify_mode(&self) -> SslVerifyMode {
        if self.strict {
            SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT
        } else {
            SslVerifyMode::PEER
        }
    }
}

/// Certificates accepted for each remote address.
///
/// Callers may pre-register an address to trust a certificate that doesn't name it; accepted
/// certificates are recorded here after each successful evaluation.
#[derive(Debug, Clone, Default)]
pub struct PeerMap {
    peers: Arc<Mutex<HashMap<String, X509>>>,
}

impl PeerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, remote_address: &str, certificate: X509) {
        self.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(remote_address.to_string(), certificate);
    }

    pub fn get(&self, remote_address: &str) -> Option<X509> {
        self.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(remote_address)
            .cloned()
    }

    pub fn remove(&self, remote_address: &str) -> Option<X509> {
        self.peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(remote_address)
    }

    fn is_registered(&self, remote_address: &str, certificate: &X509Ref) -> bool {
        self.get(remote_address)
            .is_some_and(|registered| same_certificate(&registered, certificate))
    }
}

/// Per-handshake inputs to a trust decision.
#[derive(Debug, Clone)]
pub struct TrustDecisionContext {
    /// The peer's IP address, if known.
    pub remote_address: Option<String>,
    pub peer_map: PeerMap,
    pub policy: TrustPolicy,
}

/// Decides whether a presented certificate chain is acceptable.
pub trait TrustDecision: Send + Sync {
    /// Evaluate `chain`, leaf first. An empty chain means the peer presented no certificate.
    fn evaluate(&self, chain: &[X509], context: &TrustDecisionContext) -> Result<(), TrustRejected>;
}

/// Accepts certificates issued by the root authority that are current, not revoked, and name
/// the address they connect from.
pub struct TrustEvaluator {
    root: X509,
    revocations: Arc<dyn RevocationStore>,
}

impl TrustEvaluator {
    pub fn new(root: X509, revocations: Arc<dyn RevocationStore>) -> Self {
        Self { root, revocations }
    }

    fn check_issuer(&self, leaf: &X509Ref) -> Result<(), TrustRejected> {
        let root_key = self.root.public_key().map_err(malformed)?;
        let signed = leaf.verify(&root_key).unwrap_or(false);
        let issuer = leaf.issuer_name().to_der().map_err(malformed)?;
        let root_subject = self.root.subject_name().to_der().map_err(malformed)?;
        let issuer_matches = issuer == root_subject;
        if signed && issuer_matches {
            Ok(())
        } else {
            Err(TrustRejected::UntrustedIssuer {
                subject: crypto::name_to_string(leaf.subject_name()),
            })
        }
    }

    fn check_validity(&self, leaf: &X509Ref, serial: &str) -> Result<(), TrustRejected> {
        let now = Asn1Time::days_from_now(0).map_err(malformed)?;
        let not_yet_valid = leaf.not_before().compare(&now).map_err(malformed)?.is_gt();
        let lapsed = leaf.not_after().compare(&now).map_err(malformed)?.is_lt();
        if not_yet_valid || lapsed {
            return Err(TrustRejected::OutsideValidity {
                serial: serial.to_string(),
            });
        }
        Ok(())
    }

    fn check_address(
        &self,
        leaf: &X509Ref,
        remote_address: &str,
        peer_map: &PeerMap,
    ) -> Result<(), TrustRejected> {
        if names_address(leaf, remote_address) || peer_map.is_registered(remote_address, leaf) {
            Ok(())
        } else {
            Err(TrustRejected::AddressMismatch {
                remote_address: remote_address.to_string(),
            })
        }
    }
}

impl TrustDecision for TrustEvaluator {
    fn evaluate(&self, chain: &[X509], context: &TrustDecisionContext) -> Result<(), TrustRejected> {
        let Some(leaf) = chain.first() else {
            return if context.policy.strict {
                Err(TrustRejected::MissingCertificate(
                    context
                        .remote_address
                        .clone()
                        .unwrap_or_else(|| "unknown peer".to_string()),
                ))
            } else {
                Ok(())
            };
        };

        self.check_issuer(leaf)?;
        let serial = crypto::serial_hex(leaf)
            .map_err(|error| TrustRejected::Malformed(error.to_string()))?;
        if !context.policy.allow_expired {
            self.check_validity(leaf, &serial)?;
        }
        let common_name = crypto::common_name(leaf);
        if self.revocations.is_revoked(&serial, common_name.as_deref()) {
            return Err(TrustRejected::Revoked { serial });
        }
        if let Some(remote_address) = &context.remote_address {
            self.check_address(leaf, remote_address, &context.peer_map)?;
            context.peer_map.insert(remote_address, leaf.clone());
        }
        tracing::debug!(
            %serial,
            ?common_name,
            remote_address = ?context.remote_address,
            "Accepted peer certificate"
        );
        Ok(())
    }
}

/// Run `decision` from inside an OpenSSL verify callback.
///
/// Intermediate depths keep OpenSSL's verdict; the leaf is evaluated by `decision` alone, so
/// policy (such as tolerating expired certificates) overrides OpenSSL's own checks.
pub fn verify_callback(
    decision: &dyn TrustDecision,
    context: &TrustDecisionContext,
    preverified: bool,
    store: &mut X509StoreContextRef,
) -> bool {
    if store.error_depth() != 0 {
        return preverified;
    }
    let chain: Vec<X509> = match store.chain() {
        Some(chain) if !chain.is_empty() => chain.iter().map(X509Ref::to_owned).collect(),
        _ => store.current_cert().map(X509Ref::to_owned).into_iter().collect(),
    };
    match decision.evaluate(&chain, context) {
        Ok(()) => true,
        Err(reason) => {
            tracing::warn!(
                remote_address = ?context.remote_address,
                openssl_verdict = %store.error(),
                %reason,
                "Rejected peer certificate"
            );
            false
        }
    }
}

/// Whether the certificate's subject alternative names include `address`.
fn names_address(certificate: &X509Ref, address: &str) -> bool {
    let (dns_names, ip_addresses) = crypto::subject_alt_names(certificate);
    match address.parse::<IpAddr>() {
        Ok(address) => ip_addresses.iter().any(|ip| canonical(*ip) == canonical(address)),
        Err(_) => dns_names.iter().any(|name| name.eq_ignore_ascii_case(address)),
    }
}

fn canonical(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn same_certificate(a: &X509Ref, b: &X509Ref) -> bool {
    match (a.to_der(), b.to_der()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn malformed(error: openssl::error::ErrorStack) -> TrustRejected {
    TrustRejected::Malformed(error.to_string())
}
