// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use ipnet::IpNet;
use openssl::hash::MessageDigest;
use serde::{Deserialize, Serialize};

use crate::error::CaError;

/// Configuration for the certificate authority service.
///
/// Settings that must agree across every instance of a deployment (the root key material, the
/// issuer distinguished name, and the client authentication policy) live in the shared
/// configuration store instead. Where the store has no value, the defaults here are used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The location where the service should store its state.
    ///
    /// This includes the SQLite database holding the root key material, so this directory
    /// must be shared (or the database replicated) between cooperating instances.
    ///
    /// Defaults to "/var/lib/rootca" if not set.
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,

    /// The socket address to accept TLS connections on.
    ///
    /// The default is to listen on all interfaces on port 8250.
    pub listening_address: SocketAddr,

    /// The distinguished name used as the root certificate's subject and issuer when the
    /// configuration store does not provide one, in "CN=name,O=organization" form.
    pub issuer_dn: String,

    /// The number of years the root certificate is valid for. The management certificate
    /// uses the same lifetime.
    pub root_validity_years: u32,

    /// The RSA modulus size, in bits, for issued certificates. The root key is twice this size.
    pub certificate_key_size: u32,

    /// The digest used when signing certificates, as understood by OpenSSL (e.g. "sha256").
    pub signature_digest: String,

    /// An extra DNS name placed in the management certificate's subject alternative names.
    ///
    /// Peers presenting a certificate with this name are treated as management servers.
    pub management_custom_san: String,

    /// The management network, in CIDR notation. Local addresses inside this network are
    /// added to the management certificate.
    #[serde(default)]
    pub management_network_cidr: Option<String>,

    /// The passphrase protecting the PKCS#12 management bundle.
    pub keystore_passphrase: String,

    /// How long to wait for another instance to finish setting up the root authority before
    /// falling back to loading whatever it persisted. The default is five minutes.
    pub setup_lock_timeout: Duration,

    /// How long a setup lock is held before other instances may take it over. This only
    /// matters if an instance crashes while holding it.
    pub setup_lock_lease: Duration,

    /// How often a running service re-reads revocations and the client authentication policy
    /// from the configuration store. The default is one minute.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: Duration,
}

impl Config {
    pub fn database(&self) -> PathBuf {
        self.state_directory.join("rootca.sqlite")
    }

    pub fn root_validity_days(&self) -> u32 {
        365 * self.root_validity_years
    }

    pub fn root_key_size(&self) -> u32 {
        2 * self.certificate_key_size
    }

    /// The digest to sign certificates with.
    pub fn digest(&self) -> Result<MessageDigest, CaError> {
        MessageDigest::from_name(&self.signature_digest).ok_or_else(|| {
            CaError::Configuration(format!(
                "unsupported signature digest '{}'",
                self.signature_digest
            ))
        })
    }

    /// The parsed management network, if one is configured.
    pub fn management_network(&self) -> Result<Option<IpNet>, CaError> {
        self.management_network_cidr
            .as_deref()
            .filter(|cidr| !cidr.trim().is_empty())
            .map(|cidr| {
                IpNet::from_str(cidr.trim()).map_err(|error| {
                    CaError::Configuration(format!("invalid management network '{cidr}': {error}"))
                })
            })
            .transpose()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_directory: default_state_directory(),
            listening_address: SocketAddr::from_str("[::]:8250")
                .expect("the default should be valid"),
            issuer_dn: "CN=ca.rootca.internal".to_string(),
            root_validity_years: 30,
            certificate_key_size: 2048,
            signature_digest: "sha256".to_string(),
            management_custom_san: "management.rootca.internal".to_string(),
            management_network_cidr: None,
            keystore_passphrase: "rootca-keystore".to_string(),
            setup_lock_timeout: Duration::from_secs(5 * 60),
            setup_lock_lease: Duration::from_secs(10 * 60),
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_state_directory() -> PathBuf {
    PathBuf::from("/var/lib/rootca/")
}

fn private_load_config<T>(path: &Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", T::default());
        })
        .context("configuration file is invalid")
}

/// Load the configuration with fallback options.
///
/// If `path` is [`None`], the `default` path, which should be relative to CONFIGURATION_DIRECTORY, is
/// checked.  If the default config doesn't exist, the [`Default`] implementation is returned. It's
/// expected that CONFIGURATION_DIRECTORY is set via systemd.
///
/// # Errors
///
/// In the event that one of the config files exists, but is invalid, an error is returned.
pub fn load_config<T>(path: Option<PathBuf>, default: &Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    path.or_else(|| {
        env::var("CONFIGURATION_DIRECTORY")
            .inspect_err(|error| {
                tracing::warn!(
                    ?error,
                    "CONFIGURATION_DIRECTORY environment variable isn't readable"
                );
            })
            .map(PathBuf::from)
            .ok()
            .map(|base_path| base_path.join(default))
            .filter(|path| path.is_file())
    })
    .map_or_else(
        || {
            tracing::warn!("No configuration file found; using defaults");
            Ok(T::default())
        },
        |path| {
            tracing::info!(?path, "Attempting to load configuration");
            private_load_config::<T>(&path)
        },
    )
}
