// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Bootstrapping the root authority, serialized across instances by the setup lock.

use std::sync::Arc;

use tracing::instrument;

use crate::{
    authority::{Authority, AuthorityHandle},
    config::Config,
    error::{CaError, LockError},
    lock::{self, LeaseLock},
    material::KeyMaterialManager,
    network::NetworkDiscovery,
    store::ConfigStore,
    trust::TrustPolicy,
};

/// The name of the lock held while setting up the root authority.
pub const SETUP_LOCK_NAME: &str = "root-ca-setup";

/// Loads or creates the root authority and installs it into an [`AuthorityHandle`].
pub struct SetupCoordinator<S> {
    config: Arc<Config>,
    store: Arc<S>,
    material: KeyMaterialManager<S>,
    handle: AuthorityHandle,
}

impl<S: ConfigStore + LeaseLock> SetupCoordinator<S> {
    pub fn new(
        config: Arc<Config>,
        store: Arc<S>,
        network: Arc<dyn NetworkDiscovery>,
        handle: AuthorityHandle,
    ) -> Self {
        let material = KeyMaterialManager::new(config.clone(), store.clone(), network);
        Self {
            config,
            store,
            material,
            handle,
        }
    }

    /// Set up the root authority, returning it once it is installed.
    ///
    /// The instance that takes the setup lock loads existing material and generates whatever
    /// is missing. An instance that times out waiting for the lock only loads what the holder
    /// persisted. Running this again after success returns the installed authority.
    ///
    /// # Errors
    ///
    /// [`CaError::SetupFailed`] naming the first stage that produced no usable material.
    #[instrument(skip_all, err)]
    pub async fn run(&self) -> Result<Arc<Authority>, CaError> {
        if let Ok(authority) = self.handle.get() {
            return Ok(authority);
        }

        match lock::acquire(
            self.store.clone(),
            SETUP_LOCK_NAME,
            self.config.setup_lock_lease,
            self.config.setup_lock_timeout,
        )
        .await
        {
            Ok(guard) => {
                let result = self.bootstrap().await;
                guard.release().await;
                result?;
            }
            Err(LockError::Timeout(name)) => {
                tracing::warn!(
                    lock = %name,
                    timeout = ?self.config.setup_lock_timeout,
                    "Timed out waiting for another instance to set up the root authority; loading its material"
                );
                self.load_only().await?;
            }
            Err(LockError::Store(error)) => return Err(error.into()),
        }

        let root = self.material.root_authority()?;
        let bundle = self
            .material
            .management_bundle()
            .ok_or(CaError::SetupFailed {
                stage: "management bundle",
            })?;
        let policy = TrustPolicy::load(self.store.as_ref()).await?;
        let authority = Arc::new(Authority::new(self.config.clone(), root, bundle, policy));
        self.handle.install(authority.clone());
        tracing::info!(
            strict = policy.strict,
            allow_expired = policy.allow_expired,
            "The certificate authority is ready"
        );
        Ok(authority)
    }

    /// Load the persisted material, generating only what is absent or unusable.
    ///
    /// A store that can't be read aborts setup rather than replacing material it never saw.
    async fn bootstrap(&self) -> Result<(), CaError> {
        if !self.material.try_load_root_key_pair().await?
            && !self
                .material
                .generate_root_key_pair(self.config.root_key_size())
                .await
        {
            return Err(failed("root key pair"));
        }
        if !self.material.try_load_root_certificate().await?
            && !self.material.generate_root_certificate().await
        {
            return Err(failed("root certificate"));
        }
        if !self.material.load_management_bundle().await? {
            return Err(failed("management bundle"));
        }
        Ok(())
    }

    async fn load_only(&self) -> Result<(), CaError> {
        if !self.material.try_load_root_key_pair().await? {
            return Err(failed("root key pair"));
        }
        if !self.material.try_load_root_certificate().await? {
            return Err(failed("root certificate"));
        }
        if !self.material.load_management_bundle().await? {
            return Err(failed("management bundle"));
        }
        Ok(())
    }
}

fn failed(stage: &'static str) -> CaError {
    tracing::error!(stage, "Certificate authority setup failed");
    CaError::SetupFailed { stage }
}
