// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The set-up root authority and the service interface built on it.

use std::{
    net::IpAddr,
    sync::{Arc, RwLock},
};

use openssl::{
    ssl::Ssl,
    x509::{X509Ref, X509},
};
use tracing::instrument;

use crate::{
    config::Config,
    crypto::{self, IssuedCertificate, Issuer, RootAuthority},
    error::CaError,
    material::ManagementBundle,
    revocation::{self, RevocationLedger, RevocationList},
    store::ConfigStore,
    tls::TlsEngineFactory,
    trust::{PeerMap, TrustPolicy},
};

/// Everything the service needs once setup has completed.
///
/// The key material never changes after construction; only the trust policy may be reloaded.
#[derive(Debug)]
pub struct Authority {
    config: Arc<Config>,
    root: RootAuthority,
    bundle: Arc<ManagementBundle>,
    policy: RwLock<TrustPolicy>,
}

impl Authority {
    pub fn new(
        config: Arc<Config>,
        root: RootAuthority,
        bundle: Arc<ManagementBundle>,
        policy: TrustPolicy,
    ) -> Self {
        Self {
            config,
            root,
            bundle,
            policy: RwLock::new(policy),
        }
    }

    pub fn root(&self) -> &RootAuthority {
        &self.root
    }

    pub fn bundle(&self) -> &ManagementBundle {
        &self.bundle
    }

    pub fn policy(&self) -> TrustPolicy {
        *self
            .policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_policy(&self, policy: TrustPolicy) {
        *self
            .policy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = policy;
    }

    pub fn issuer(&self) -> Result<Issuer<'_>, CaError> {
        Issuer::new(&self.root, &self.config)
    }
}

/// A shared slot for the [`Authority`], filled in once setup completes.
#[derive(Debug, Clone, Default)]
pub struct AuthorityHandle {
    authority: Arc<RwLock<Option<Arc<Authority>>>>,
}

impl AuthorityHandle {
    /// The installed authority.
    ///
    /// # Errors
    ///
    /// [`CaError::NotReady`] if setup hasn't completed.
    pub fn get(&self) -> Result<Arc<Authority>, CaError> {
        self.authority
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(CaError::NotReady)
    }

    pub fn install(&self, authority: Arc<Authority>) {
        *self
            .authority
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(authority);
    }

    pub fn is_ready(&self) -> bool {
        self.get().is_ok()
    }
}

/// The certificate authority's public operations.
pub struct CaService<S> {
    config: Arc<Config>,
    store: Arc<S>,
    handle: AuthorityHandle,
    revocations: RevocationList,
    tls: TlsEngineFactory,
}

impl<S: ConfigStore + RevocationLedger> CaService<S> {
    pub fn new(
        config: Arc<Config>,
        store: Arc<S>,
        handle: AuthorityHandle,
        revocations: RevocationList,
    ) -> Self {
        let tls = TlsEngineFactory::new(handle.clone(), Arc::new(revocations.clone()));
        Self {
            config,
            store,
            handle,
            revocations,
            tls,
        }
    }

    pub fn handle(&self) -> &AuthorityHandle {
        &self.handle
    }

    pub fn tls_engine_factory(&self) -> &TlsEngineFactory {
        &self.tls
    }

    /// Issue a certificate and key pair for `dns_names` and `ip_addresses`.
    pub fn issue_certificate(
        &self,
        dns_names: &[String],
        ip_addresses: &[IpAddr],
        validity_days: u32,
    ) -> Result<IssuedCertificate, CaError> {
        self.handle
            .get()?
            .issuer()?
            .issue(dns_names, ip_addresses, validity_days)
    }

    /// Issue a certificate for a PEM signing request, adding `dns_names` and `ip_addresses` to
    /// the names it requests.
    pub fn issue_certificate_from_csr(
        &self,
        csr_pem: &str,
        dns_names: &[String],
        ip_addresses: &[IpAddr],
        validity_days: u32,
    ) -> Result<IssuedCertificate, CaError> {
        self.handle
            .get()?
            .issuer()?
            .issue_from_csr(csr_pem, dns_names, ip_addresses, validity_days)
    }

    /// Create a server-side TLS session for a connection from `remote_address`.
    pub fn create_tls_engine(
        &self,
        remote_address: Option<&str>,
        peer_map: &PeerMap,
    ) -> Result<Ssl, CaError> {
        self.tls.create(remote_address, peer_map)
    }

    /// Whether `certificate` belongs to a management server.
    pub fn is_management_certificate(&self, certificate: &X509Ref) -> bool {
        names_management_server(certificate, &self.config.management_custom_san)
    }

    /// The certificates a peer needs to trust this authority.
    pub fn ca_certificates(&self) -> Result<Vec<X509>, CaError> {
        Ok(vec![self.handle.get()?.root().certificate().clone()])
    }

    /// Revoke a certificate by serial number, common name, or both.
    ///
    /// The revocation applies to this instance's handshakes immediately and is persisted for
    /// other instances to pick up.
    #[instrument(skip(self), err)]
    pub async fn revoke_certificate(&self, serial: &str, common_name: &str) -> Result<(), CaError> {
        if serial.trim().is_empty() && common_name.trim().is_empty() {
            return Err(CaError::Configuration(
                "a serial number or common name is required".to_string(),
            ));
        }
        self.store.record_revocation(serial, common_name).await?;
        self.revocations.revoke(serial, common_name);
        tracing::info!(serial, common_name, "Revoked certificate");
        Ok(())
    }

    /// Reload revocations recorded by other instances.
    pub async fn refresh_revocations(&self) -> Result<(), CaError> {
        revocation::refresh(self.store.as_ref(), &self.revocations).await?;
        Ok(())
    }

    /// Re-read the trust policy from the configuration store.
    ///
    /// The new policy applies to TLS engines created afterwards.
    #[instrument(skip(self), err)]
    pub async fn reload_policy(&self) -> Result<TrustPolicy, CaError> {
        let authority = self.handle.get()?;
        let policy = TrustPolicy::load(self.store.as_ref()).await?;
        if policy != authority.policy() {
            tracing::info!(?policy, "Trust policy changed");
        }
        authority.set_policy(policy);
        Ok(policy)
    }
}

/// Whether one of the certificate's DNS names is exactly `management_name`.
pub fn names_management_server(certificate: &X509Ref, management_name: &str) -> bool {
    let (dns_names, _) = crypto::subject_alt_names(certificate);
    matches_management_name(&dns_names, management_name)
}

fn matches_management_name(dns_names: &[String], management_name: &str) -> bool {
    !management_name.is_empty() && dns_names.iter().any(|name| name == management_name)
}
