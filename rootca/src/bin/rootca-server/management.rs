// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Implements the management commands for the rootca-server CLI.

use std::{io::Write, sync::Arc};

use anyhow::Context;
use rootca::{
    authority::{AuthorityHandle, CaService},
    cli::ManagementCommands,
    config::Config,
    db::{self, SqliteStore},
    network::SystemNetwork,
    revocation::RevocationList,
    setup::SetupCoordinator,
    trust::TrustPolicy,
};
use tracing::instrument;

/// Open the service database, creating and migrating it if necessary.
pub async fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    std::fs::create_dir_all(&config.state_directory).with_context(|| {
        format!(
            "Failed to create the state directory {}",
            config.state_directory.display()
        )
    })?;
    SqliteStore::open(&config.database()).await
}

#[instrument(skip_all)]
pub async fn manage<W: Write>(
    command: ManagementCommands,
    config: Config,
    output: &mut W,
) -> anyhow::Result<()> {
    let config = Arc::new(config);

    match command {
        ManagementCommands::Migrate {} => {
            std::fs::create_dir_all(&config.state_directory)?;
            let db_pool = db::pool(
                config
                    .database()
                    .as_os_str()
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("Database path isn't valid UTF8"))?,
                false,
            )
            .await?;
            db::migrate(&db_pool).await?;
            writeln!(output, "Database at {} is up to date", config.database().display())?;
        }
        ManagementCommands::Setup {} => {
            let service = set_up(&config).await?;
            let authority = service.handle().get()?;
            writeln!(
                output,
                "Root authority {} is ready (serial {})",
                rootca::crypto::name_to_string(authority.root().certificate().subject_name()),
                rootca::crypto::serial_hex(authority.root().certificate())?
            )?;
        }
        ManagementCommands::Issue {
            dns_names,
            ip_addresses,
            days,
            csr,
            key_out,
        } => {
            let service = set_up(&config).await?;
            let issued = match csr {
                Some(path) => {
                    let csr_pem = std::fs::read_to_string(&path).with_context(|| {
                        format!("Failed to read the signing request at {}", path.display())
                    })?;
                    service.issue_certificate_from_csr(
                        &csr_pem,
                        &dns_names,
                        &ip_addresses,
                        days.get(),
                    )?
                }
                None => service.issue_certificate(&dns_names, &ip_addresses, days.get())?,
            };
            tracing::info!(serial = %issued.serial()?, "Issued certificate");

            write!(output, "{}", issued.certificate_pem()?)?;
            if let Some(private_key) = issued.private_key_pem()? {
                match key_out {
                    Some(path) => {
                        write_private_key(&path, &private_key)?;
                        eprintln!("Wrote the private key to {}", path.display());
                    }
                    None => write!(output, "{private_key}")?,
                }
            }
        }
        ManagementCommands::Revoke {
            serial,
            common_name,
        } => {
            let store = Arc::new(open_store(&config).await?);
            let service = CaService::new(
                config.clone(),
                store,
                AuthorityHandle::default(),
                RevocationList::new(),
            );
            service
                .revoke_certificate(&serial, common_name.as_deref().unwrap_or_default())
                .await?;
            writeln!(output, "Certificate revoked")?;
        }
        ManagementCommands::CaCertificate {} => {
            let service = set_up(&config).await?;
            for certificate in service.ca_certificates()? {
                output.write_all(&certificate.to_pem()?)?;
            }
        }
        ManagementCommands::Policy {
            strict,
            allow_expired,
        } => {
            let store = open_store(&config).await?;
            let mut policy = TrustPolicy::load(&store).await?;
            if strict.is_some() || allow_expired.is_some() {
                policy.strict = strict.unwrap_or(policy.strict);
                policy.allow_expired = allow_expired.unwrap_or(policy.allow_expired);
                policy.store(&store).await?;
            }
            writeln!(
                output,
                "strict = {}\nallow_expired = {}",
                policy.strict, policy.allow_expired
            )?;
        }
    }

    Ok(())
}

/// Run setup and return a service backed by the resulting authority.
async fn set_up(config: &Arc<Config>) -> anyhow::Result<CaService<SqliteStore>> {
    let store = Arc::new(open_store(config).await?);
    let handle = AuthorityHandle::default();
    SetupCoordinator::new(
        config.clone(),
        store.clone(),
        Arc::new(SystemNetwork),
        handle.clone(),
    )
    .run()
    .await?;
    Ok(CaService::new(
        config.clone(),
        store,
        handle,
        RevocationList::new(),
    ))
}

fn write_private_key(path: &std::path::Path, private_key: &str) -> anyhow::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(private_key.as_bytes())?;
    Ok(())
}
