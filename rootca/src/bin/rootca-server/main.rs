// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use rootca::{
    authority::{AuthorityHandle, CaService},
    cli,
    config::{load_config, Config},
    crypto,
    db::SqliteStore,
    network::SystemNetwork,
    revocation::{self, RevocationList},
    server::{self, ConnectionHandler},
    setup::SetupCoordinator,
    trust::PeerMap,
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    signal::unix::{signal, SignalKind},
};
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};

mod management;

// The path, relative to $XDG_CONFIG_HOME, of the default config file location.
const DEFAULT_CONFIG: &str = "rootca/server.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = cli::Cli::parse();

    // For management commands the defaults are too noisy.
    let log_filter = if matches!(opts.command, cli::Command::Manage(_))
        && opts.log_filter == "WARN,rootca=INFO"
    {
        EnvFilter::builder()
            .parse("WARN")
            .context("The developer messed up and provided an invalid default")
    } else {
        // Unfortunately we can't use clap's value_parser since EnvFilter does not
        // implement Clone.
        EnvFilter::builder().parse(&opts.log_filter).context(
            "ROOTCA_SERVER_LOG contains an invalid log directive; refer to \
            https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
            filter/struct.EnvFilter.html#directives for format details.",
        )
    }?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let config = load_config::<Config>(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path())?;

    match opts.command {
        cli::Command::Listen {} => {
            let root_span = tracing::info_span!("server");
            async move { listen(config).await }
                .instrument(root_span)
                .await?;
        }
        cli::Command::Config {} => {
            println!("# This is the current configuration\n\n{config}\n# This concludes the configuration.\n");
            _ = config.management_network().inspect_err(|error| {
                eprintln!("The configuration format is valid, but the management network isn't: {error:?}");
            });
            _ = config.digest().inspect_err(|error| {
                eprintln!("The configuration format is valid, but the signature digest isn't: {error:?}");
            });
        }
        cli::Command::Manage(command) => {
            management::manage(command, config, &mut std::io::stdout()).await?
        }
    };

    Ok(())
}

/// Set up the root authority and serve the root certificate until halted.
async fn listen(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let store = Arc::new(management::open_store(&config).await?);
    let handle = AuthorityHandle::default();
    SetupCoordinator::new(
        config.clone(),
        store.clone(),
        Arc::new(SystemNetwork),
        handle.clone(),
    )
    .run()
    .await?;

    let revocations = RevocationList::new();
    revocation::refresh(store.as_ref(), &revocations).await?;
    let service = Arc::new(CaService::new(
        config.clone(),
        store,
        handle,
        revocations,
    ));

    let listener = server::listen(
        config.listening_address,
        service.tls_engine_factory().clone(),
        PeerMap::new(),
        Arc::new(RootCertificateResponder {
            service: service.clone(),
        }),
    )
    .await?;
    let halt_token = listener.halt_token();
    tokio::spawn(signal_handler(halt_token.clone()));
    let refresher = tokio::spawn(
        refresh(service, config.refresh_interval, halt_token)
            .instrument(tracing::Span::current()),
    );

    listener.wait_to_finish().await?;
    refresher.await?;
    Ok(())
}

/// Periodically pick up revocations and policy changes made by other instances.
async fn refresh(
    service: Arc<CaService<SqliteStore>>,
    interval: std::time::Duration,
    halt_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = halt_token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(error) = service.refresh_revocations().await {
                    tracing::warn!(?error, "Failed to refresh the revocation list");
                }
                if let Err(error) = service.reload_policy().await {
                    tracing::warn!(?error, "Failed to reload the trust policy");
                }
            }
        }
    }
}

/// Sends the root certificate to each authenticated peer.
struct RootCertificateResponder {
    service: Arc<CaService<SqliteStore>>,
}

impl ConnectionHandler for RootCertificateResponder {
    async fn handle(
        &self,
        mut stream: SslStream<TcpStream>,
        remote_address: SocketAddr,
    ) -> anyhow::Result<()> {
        match stream.ssl().peer_certificate() {
            Some(peer) => tracing::info!(
                ?remote_address,
                subject = %crypto::name_to_string(peer.subject_name()),
                management = self.service.is_management_certificate(&peer),
                "Peer authenticated"
            ),
            None => tracing::info!(?remote_address, "Peer connected without a certificate"),
        }

        for certificate in self.service.ca_certificates()? {
            stream.write_all(&certificate.to_pem()?).await?;
        }
        stream.shutdown().await?;
        Ok(())
    }
}

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// Sending SIGTERM or SIGINT to the process will cause it to stop accepting new
/// connections. Existing connections will be allowed to complete before the process
/// shuts down.
async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, beginning service shutdown");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, beginning service shutdown");
                halt_token.cancel();
            }
        }
    }
}
