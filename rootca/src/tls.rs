// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Per-connection TLS sessions presenting the management identity.

use std::sync::Arc;

use openssl::{
    error::ErrorStack,
    ssl::{Ssl, SslAcceptor, SslMethod},
    x509::X509,
};
use tracing::instrument;

use crate::{
    authority::AuthorityHandle,
    error::CaError,
    material::Identity,
    revocation::RevocationStore,
    trust::{verify_callback, PeerMap, TrustDecision, TrustDecisionContext, TrustEvaluator},
};

/// Creates server-side TLS sessions once the root authority is set up.
///
/// Sessions are built from the current authority and policy each time, so a policy reload
/// applies to the next connection.
#[derive(Clone)]
pub struct TlsEngineFactory {
    handle: AuthorityHandle,
    revocations: Arc<dyn RevocationStore>,
}

impl TlsEngineFactory {
    pub fn new(handle: AuthorityHandle, revocations: Arc<dyn RevocationStore>) -> Self {
        Self {
            handle,
            revocations,
        }
    }

    /// Create a session for a connection from `remote_address`.
    ///
    /// Accepted peer certificates are recorded in `peer_map`.
    ///
    /// # Errors
    ///
    /// [`CaError::NotReady`] before setup has completed; this never waits on setup.
    /// [`CaError::TlsSetup`] if OpenSSL rejects the identity or configuration.
    #[instrument(skip(self, peer_map), err)]
    pub fn create(&self, remote_address: Option<&str>, peer_map: &PeerMap) -> Result<Ssl, CaError> {
        let authority = self.handle.get()?;
        let identity = authority.bundle().identity()?;
        let context = TrustDecisionContext {
            remote_address: remote_address.map(str::to_string),
            peer_map: peer_map.clone(),
            policy: authority.policy(),
        };
        let decision = Arc::new(TrustEvaluator::new(
            authority.root().certificate().clone(),
            self.revocations.clone(),
        ));
        let acceptor = acceptor(&identity, authority.root().certificate(), decision, context)
            .map_err(CaError::TlsSetup)?;
        Ssl::new(acceptor.context()).map_err(CaError::TlsSetup)
    }
}

/// The OpenSSL security level sessions are built with; level 2 refuses RSA keys under 2048 bits.
pub(crate) const MINIMUM_SECURITY_LEVEL: u32 = 2;

fn acceptor(
    identity: &Identity,
    root: &X509,
    decision: Arc<dyn TrustDecision>,
    context: TrustDecisionContext,
) -> Result<SslAcceptor, ErrorStack> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
    acceptor.set_security_level(MINIMUM_SECURITY_LEVEL);
    acceptor.set_private_key(&identity.private_key)?;
    acceptor.set_certificate(&identity.certificate)?;
    for certificate in &identity.chain {
        acceptor.add_extra_chain_cert(certificate.clone())?;
    }
    acceptor.check_private_key()?;
    acceptor.cert_store_mut().add_cert(root.clone())?;
    acceptor.add_client_ca(root)?;
    acceptor.set_verify_callback(context.policy.verify_mode(), move |preverified, store| {
        verify_callback(decision.as_ref(), &context, preverified, store)
    });
    Ok(acceptor.build())
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;

    use openssl::{
        pkey::{PKey, Private},
        ssl::{SslConnector, SslVerifyMode},
    };
    use tokio_openssl::SslStream;

    use super::*;
    use crate::{
        authority::Authority,
        config::Config,
        crypto::{issuer, Issuer},
        material::ManagementBundle,
        revocation::RevocationList,
        trust::TrustPolicy,
    };

    fn config() -> Arc<Config> {
        Arc::new(Config {
            certificate_key_size: 2048,
            ..Default::default()
        })
    }

    fn authority(config: &Arc<Config>, policy: TrustPolicy) -> anyhow::Result<Arc<Authority>> {
        let root = issuer::tests::root(config)?;
        let issued = Issuer::new(&root, config)?.issue(
            &[config.management_custom_san.clone()],
            &[],
            1,
        )?;
        let bundle =
            ManagementBundle::build(&issued, root.certificate(), &config.keystore_passphrase)?;
        Ok(Arc::new(Authority::new(
            config.clone(),
            root,
            Arc::new(bundle),
            policy,
        )))
    }

    /// Perform a handshake over an in-memory pipe, returning the server's result.
    async fn handshake(
        server: Ssl,
        root: &X509,
        client_identity: Option<(&X509, &PKey<Private>)>,
        server_name: &str,
    ) -> anyhow::Result<Result<(), openssl::ssl::Error>> {
        let mut connector = SslConnector::builder(SslMethod::tls())?;
        connector.set_verify(SslVerifyMode::PEER);
        connector.cert_store_mut().add_cert(root.clone())?;
        if let Some((certificate, key)) = client_identity {
            connector.set_certificate(certificate)?;
            connector.set_private_key(key)?;
        }
        let client = connector.build().configure()?.into_ssl(server_name)?;

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut server = SslStream::new(server, server_io)?;
        let mut client = SslStream::new(client, client_io)?;
        let (server_result, _client_result) = tokio::join!(
            Pin::new(&mut server).accept(),
            Pin::new(&mut client).connect()
        );
        Ok(server_result)
    }

    #[tokio::test]
    async fn not_ready_before_setup() -> anyhow::Result<()> {
        let factory =
            TlsEngineFactory::new(AuthorityHandle::default(), Arc::new(RevocationList::new()));
        assert!(matches!(
            factory.create(Some("127.0.0.1"), &PeerMap::new()),
            Err(CaError::NotReady)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn strict_requires_client_certificate() -> anyhow::Result<()> {
        let config = config();
        let strict = TrustPolicy {
            strict: true,
            allow_expired: false,
        };
        let authority = authority(&config, strict)?;
        let handle = AuthorityHandle::default();
        handle.install(authority.clone());
        let factory = TlsEngineFactory::new(handle, Arc::new(RevocationList::new()));
        let root = authority.root().certificate().clone();

        let engine = factory.create(Some("127.0.0.1"), &PeerMap::new())?;
        let result = handshake(engine, &root, None, &config.management_custom_san).await?;
        assert!(result.is_err());

        // The same handshake without strictness succeeds.
        authority.set_policy(TrustPolicy::default());
        let engine = factory.create(Some("127.0.0.1"), &PeerMap::new())?;
        let result = handshake(engine, &root, None, &config.management_custom_san).await?;
        assert!(result.is_ok(), "{result:?}");
        Ok(())
    }

    #[tokio::test]
    async fn client_certificate_is_evaluated() -> anyhow::Result<()> {
        let config = config();
        let authority = authority(&config, TrustPolicy::default())?;
        let handle = AuthorityHandle::default();
        handle.install(authority.clone());
        let revocations = RevocationList::new();
        let factory = TlsEngineFactory::new(handle, Arc::new(revocations.clone()));
        let root = authority.root().certificate().clone();
        let client = Issuer::new(authority.root(), &config)?.issue(
            &["client.example".to_string()],
            &["127.0.0.1".parse::<std::net::IpAddr>()?],
            1,
        )?;
        let client_key = client.private_key.clone().expect("key is generated");

        let peers = PeerMap::new();
        let engine = factory.create(Some("127.0.0.1"), &peers)?;
        let result = handshake(
            engine,
            &root,
            Some((&client.certificate, &client_key)),
            &config.management_custom_san,
        )
        .await?;
        assert!(result.is_ok(), "{result:?}");
        assert!(peers.get("127.0.0.1").is_some());

        // Once revoked, the same certificate is refused even though the policy is lenient.
        revocations.revoke(&client.serial()?, "");
        let engine = factory.create(Some("127.0.0.1"), &PeerMap::new())?;
        let result = handshake(
            engine,
            &root,
            Some((&client.certificate, &client_key)),
            &config.management_custom_san,
        )
        .await?;
        assert!(result.is_err());
        Ok(())
    }
}
