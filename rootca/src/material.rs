// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Loading, generating, and persisting the root authority's key material.
//!
//! Every operation prefers loading what is already persisted and only generates as a fallback,
//! so restarts and other instances reuse the same root.

use std::sync::{Arc, RwLock};

use openssl::{
    error::ErrorStack,
    pkcs12::Pkcs12,
    pkey::{PKey, Private, Public},
    ssl::{SslAcceptor, SslMethod},
    stack::Stack,
    x509::X509,
};
use tracing::instrument;

use crate::{
    config::Config,
    crypto::{self, issuer, IssuedCertificate, Issuer, RootAuthority},
    error::{CaError, StoreError},
    network::{self, NetworkDiscovery},
    store::{keys, ConfigStore},
    tls::MINIMUM_SECURITY_LEVEL,
};

/// The identity the service presents during TLS handshakes, wrapped in a PKCS#12 container.
pub struct ManagementBundle {
    der: Vec<u8>,
    passphrase: String,
    certificate: X509,
}

impl std::fmt::Debug for ManagementBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementBundle")
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

/// The private key, certificate, and chain unpacked from a [`ManagementBundle`].
pub struct Identity {
    pub private_key: PKey<Private>,
    pub certificate: X509,
    pub chain: Vec<X509>,
}

impl ManagementBundle {
    /// The friendly name of the key entry in the container.
    pub const IDENTITY_ALIAS: &'static str = "management";

    /// Package an issued certificate and its key along with the root certificate.
    pub fn build(
        issued: &IssuedCertificate,
        root: &X509,
        passphrase: &str,
    ) -> Result<Self, CaError> {
        let private_key = issued.private_key.as_ref().ok_or_else(|| {
            CaError::Configuration("the management certificate has no private key".to_string())
        })?;
        let mut chain = Stack::new().map_err(CaError::crypto("building the key store"))?;
        chain
            .push(root.clone())
            .map_err(CaError::crypto("building the key store"))?;
        let der = Pkcs12::builder()
            .name(Self::IDENTITY_ALIAS)
            .pkey(private_key)
            .cert(&issued.certificate)
            .ca(chain)
            .build2(passphrase)
            .and_then(|pkcs12| pkcs12.to_der())
            .map_err(CaError::crypto("building the key store"))?;
        Ok(Self {
            der,
            passphrase: passphrase.to_string(),
            certificate: issued.certificate.clone(),
        })
    }

    /// The DER-encoded PKCS#12 container.
    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    /// The management certificate.
    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// Unpack the container.
    pub fn identity(&self) -> Result<Identity, CaError> {
        let parsed = Pkcs12::from_der(&self.der)
            .and_then(|pkcs12| pkcs12.parse2(&self.passphrase))
            .map_err(CaError::TlsSetup)?;
        let (Some(private_key), Some(certificate)) = (parsed.pkey, parsed.cert) else {
            return Err(CaError::Configuration(
                "the management key store is missing its key or certificate".to_string(),
            ));
        };
        let chain = parsed
            .ca
            .map(|chain| chain.into_iter().collect())
            .unwrap_or_default();
        Ok(Identity {
            private_key,
            certificate,
            chain,
        })
    }
}

#[derive(Default)]
struct Material {
    key_pair: Option<(PKey<Private>, PKey<Public>)>,
    certificate: Option<X509>,
    bundle: Option<Arc<ManagementBundle>>,
}

/// Loads and generates the root key pair, root certificate, and management bundle.
///
/// Generation methods report success as a `bool` and log the cause of any failure; callers
/// only need to know whether usable material exists.
pub struct KeyMaterialManager<S> {
    config: Arc<Config>,
    store: Arc<S>,
    network: Arc<dyn NetworkDiscovery>,
    material: RwLock<Material>,
}

impl<S: ConfigStore> KeyMaterialManager<S> {
    pub fn new(config: Arc<Config>, store: Arc<S>, network: Arc<dyn NetworkDiscovery>) -> Self {
        Self {
            config,
            store,
            network,
            material: RwLock::new(Material::default()),
        }
    }

    fn material(&self) -> std::sync::RwLockReadGuard<'_, Material> {
        self.material
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn material_mut(&self) -> std::sync::RwLockWriteGuard<'_, Material> {
        self.material
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load the persisted root key pair. Returns `false` if it is missing, unusable, or could
    /// not be read.
    pub async fn load_root_key_pair(&self) -> bool {
        self.try_load_root_key_pair().await.unwrap_or(false)
    }

    /// Load the persisted root key pair.
    ///
    /// Returns `Ok(false)` if nothing is persisted or the persisted keys are unusable, in which
    /// case generating a new pair is appropriate.
    ///
    /// # Errors
    ///
    /// If the store could not be read. The persisted material may still exist, so callers must
    /// not generate a replacement.
    #[instrument(skip_all, err)]
    pub async fn try_load_root_key_pair(&self) -> Result<bool, StoreError> {
        let public = self.non_empty(keys::ROOT_PUBLIC_KEY).await?;
        let private = self.non_empty(keys::ROOT_PRIVATE_KEY).await?;
        let (Some(public), Some(private)) = (public, private) else {
            tracing::info!("No root key pair has been persisted");
            return Ok(false);
        };
        match parse_key_pair(&public, &private) {
            Ok(key_pair) => {
                tracing::info!(bits = key_pair.0.bits(), "Loaded the root key pair");
                self.material_mut().key_pair = Some(key_pair);
                Ok(true)
            }
            Err(error) => {
                tracing::warn!(%error, "The persisted root key pair is unusable");
                Ok(false)
            }
        }
    }

    async fn non_empty(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(name)
            .await?
            .filter(|value| !value.trim().is_empty()))
    }

    /// Generate and persist a new root key pair of `bits` bits, then load it back.
    #[instrument(skip(self))]
    pub async fn generate_root_key_pair(&self, bits: u32) -> bool {
        let encoded = crypto::generate_rsa_key(bits).and_then(|key| {
            let public = key
                .public_key_to_pem()
                .map_err(CaError::crypto("encoding the root public key"))?;
            let private = key
                .private_key_to_pem_pkcs8()
                .map_err(CaError::crypto("encoding the root private key"))?;
            Ok((public, private))
        });
        let (public, private) = match encoded {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::error!(%error, "Failed to generate the root key pair");
                return false;
            }
        };

        for (name, pem) in [
            (keys::ROOT_PUBLIC_KEY, public),
            (keys::ROOT_PRIVATE_KEY, private),
        ] {
            let pem = String::from_utf8_lossy(&pem);
            if let Err(error) = self.store.update(name, &pem).await {
                tracing::error!(name, %error, "Failed to persist root key material");
            }
        }
        self.load_root_key_pair().await
    }

    /// Load the persisted root certificate and check it was signed by the loaded root key.
    /// Returns `false` if it is missing, unusable, or could not be read.
    pub async fn load_root_certificate(&self) -> bool {
        self.try_load_root_certificate().await.unwrap_or(false)
    }

    /// Load the persisted root certificate.
    ///
    /// Returns `Ok(false)` if the key pair isn't loaded, or if the certificate is missing,
    /// malformed, or not signed by the root key.
    ///
    /// # Errors
    ///
    /// If the store could not be read.
    #[instrument(skip_all, err)]
    pub async fn try_load_root_certificate(&self) -> Result<bool, StoreError> {
        let Some((_, public_key)) = self.material().key_pair.clone() else {
            tracing::warn!("Cannot load the root certificate without the root key pair");
            return Ok(false);
        };
        let Some(pem) = self.non_empty(keys::ROOT_CERTIFICATE).await? else {
            tracing::info!("No root certificate has been persisted");
            return Ok(false);
        };
        let certificate = match X509::from_pem(pem.as_bytes()) {
            Ok(certificate) => certificate,
            Err(error) => {
                tracing::warn!(%error, "The persisted root certificate is malformed");
                return Ok(false);
            }
        };
        match certificate.verify(&public_key) {
            Ok(true) => {
                tracing::info!(
                    subject = %crypto::name_to_string(certificate.subject_name()),
                    "Loaded the root certificate"
                );
                self.material_mut().certificate = Some(certificate);
                Ok(true)
            }
            Ok(false) => {
                tracing::warn!("The persisted root certificate was not signed by the root key");
                Ok(false)
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to verify the persisted root certificate");
                Ok(false)
            }
        }
    }

    /// Create, persist, and load a self-signed root certificate for the loaded key pair.
    #[instrument(skip_all)]
    pub async fn generate_root_certificate(&self) -> bool {
        let Some((private_key, _)) = self.material().key_pair.clone() else {
            tracing::error!("Cannot generate the root certificate without the root key pair");
            return false;
        };
        let issuer_dn = match self.non_empty(keys::ROOT_ISSUER_DN).await {
            Ok(dn) => dn.unwrap_or_else(|| self.config.issuer_dn.clone()),
            Err(error) => {
                tracing::error!(%error, "Failed to read the issuer DN");
                return false;
            }
        };
        let pem = crypto::parse_distinguished_name(&issuer_dn).and_then(|name| {
            let certificate = issuer::self_signed(
                &private_key,
                &name,
                self.config.root_validity_days(),
                self.config.digest()?,
            )?;
            certificate
                .to_pem()
                .map_err(CaError::crypto("encoding the root certificate"))
        });
        let pem = match pem {
            Ok(pem) => pem,
            Err(error) => {
                tracing::error!(%issuer_dn, %error, "Failed to create the root certificate");
                return false;
            }
        };
        if let Err(error) = self
            .store
            .update(keys::ROOT_CERTIFICATE, &String::from_utf8_lossy(&pem))
            .await
        {
            tracing::error!(%error, "Failed to persist the root certificate");
        }
        self.load_root_certificate().await
    }

    /// The loaded root authority.
    ///
    /// # Errors
    ///
    /// [`CaError::Configuration`] if the key pair or the certificate is not loaded.
    pub fn root_authority(&self) -> Result<RootAuthority, CaError> {
        let material = self.material();
        match (&material.key_pair, &material.certificate) {
            (Some((private_key, public_key)), Some(certificate)) => RootAuthority::new(
                private_key.clone(),
                public_key.clone(),
                certificate.clone(),
            ),
            _ => Err(CaError::Configuration(
                "the root key pair and certificate must be loaded first".to_string(),
            )),
        }
    }

    /// Issue the management certificate and package it for the TLS engine.
    ///
    /// Returns `Ok(true)` if a bundle is available, and `Ok(false)` if the container could not be
    /// assembled or OpenSSL refuses to present it (for example, because the key is too small).
    /// A malformed management network is logged and ignored.
    ///
    /// # Errors
    ///
    /// If the root authority is not loaded, the local network can't be inspected, or the
    /// certificate can't be issued.
    #[instrument(skip_all, err)]
    pub async fn load_management_bundle(&self) -> Result<bool, CaError> {
        if self.material().bundle.is_some() {
            return Ok(true);
        }
        let root = self.root_authority()?;
        let management_network = self.config.management_network().unwrap_or_else(|error| {
            tracing::warn!(%error, "Ignoring the malformed management network");
            None
        });
        let addresses: Vec<_> =
            network::candidate_addresses(self.network.as_ref(), management_network.as_ref())?
                .into_iter()
                .collect();
        let mut dns_names = vec![];
        match self.network.hostname() {
            Ok(hostname) if !hostname.is_empty() => dns_names.push(hostname),
            Ok(_) => tracing::warn!("The host name is empty"),
            Err(error) => tracing::warn!(%error, "Unable to determine the host name"),
        }
        let custom_san = &self.config.management_custom_san;
        if !custom_san.is_empty() && !dns_names.contains(custom_san) {
            dns_names.push(custom_san.clone());
        }

        let issued = Issuer::new(&root, &self.config)?.issue(
            &dns_names,
            &addresses,
            self.config.root_validity_days(),
        )?;
        if issued.private_key.is_none() {
            return Err(CaError::Configuration(
                "the management certificate was issued without a private key".to_string(),
            ));
        }
        let bundle = ManagementBundle::build(
            &issued,
            root.certificate(),
            &self.config.keystore_passphrase,
        )
        .and_then(|bundle| {
            check_usable(&bundle.identity()?).map_err(CaError::TlsSetup)?;
            Ok(bundle)
        });
        match bundle {
            Ok(bundle) => {
                tracing::info!(
                    ?dns_names,
                    ?addresses,
                    serial = %issued.serial()?,
                    "Built the management key store"
                );
                self.material_mut().bundle = Some(Arc::new(bundle));
                Ok(true)
            }
            Err(error) => {
                tracing::error!(%error, "Failed to build the management key store");
                Ok(false)
            }
        }
    }

    /// The management bundle, if it has been built.
    pub fn management_bundle(&self) -> Option<Arc<ManagementBundle>> {
        self.material().bundle.clone()
    }
}

fn parse_key_pair(public: &str, private: &str) -> Result<(PKey<Private>, PKey<Public>), CaError> {
    let public = PKey::public_key_from_pem(public.as_bytes())
        .map_err(CaError::crypto("parsing the root public key"))?;
    let private = PKey::private_key_from_pem(private.as_bytes())
        .map_err(CaError::crypto("parsing the root private key"))?;
    if !private.public_eq(&public) {
        return Err(CaError::Configuration(
            "the root private key does not match the root public key".to_string(),
        ));
    }
    Ok((private, public))
}

/// Check OpenSSL will present `identity` during a handshake.
fn check_usable(identity: &Identity) -> Result<(), ErrorStack> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
    acceptor.set_security_level(MINIMUM_SECURITY_LEVEL);
    acceptor.set_private_key(&identity.private_key)?;
    acceptor.set_certificate(&identity.certificate)?;
    acceptor.check_private_key()
}
