// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# rootca

A self-hosted root certificate authority for a cluster of cooperating service instances.

The authority generates (or loads) a root RSA key pair and a self-signed root certificate, keeps
them in a shared configuration store, and issues leaf certificates for DNS names and IP addresses,
either with a freshly generated key or for a PEM certificate signing request. It also presents a
management identity signed by the root over TLS and decides, per connection, whether a client
certificate is trusted.

## Components

The [`setup::SetupCoordinator`] bootstraps the authority. Only one instance at a time holds the
setup lock; it loads whatever key material already exists and generates what is missing, so every
instance of a deployment converges on the same root. An instance that gives up waiting for the lock
loads what the lock holder persisted instead.

Once setup has installed an [`authority::Authority`], the [`tls::TlsEngineFactory`] builds a
server-side TLS session for each connection. Client certificates are checked by the
[`trust::TrustEvaluator`]: they must be issued by the root, unexpired (unless the policy allows
expired certificates), not revoked, and name the peer's address or be the certificate already
registered for it. Whether a client certificate is required at all is controlled by the trust
policy in the configuration store.

[`authority::CaService`] ties these together for callers that need to issue certificates, create
TLS sessions, revoke certificates, or reload the trust policy.

## Crate features

* **cli** -
  Include the `rootca-server` CLI. This is a default feature.
*/

pub mod authority;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod lock;
pub mod material;
pub mod network;
pub mod revocation;
pub mod server;
pub mod setup;
pub mod store;
pub mod tls;
pub mod trust;
