// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Define the command-line interface.
//!
//! This is where subcommands, the arguments, and their types are defined.

use std::{net::IpAddr, num::NonZeroU32, path::PathBuf};

use clap::Parser;

/// The rootca certificate authority server.
///
/// This includes a command to run the service, along with a set of management commands.
/// These include applying database migrations, setting up the root authority, issuing and
/// revoking certificates, and changing the client authentication policy.
///
/// To begin, you'll need to provide a configuration file. For an example of the current
/// format, consult the `config` subcommand.
///
/// Once you have a valid configuration, create a new database using the `manage migrate`
/// subcommand. The root authority is created the first time any instance runs `listen` or
/// `manage setup`.
///
/// Be aware that management commands should be run with the same user the service runs as.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// The path to the server's configuration file.
    ///
    /// If no path is provided, the defaults are used. To view the service configuration,
    /// run the `config` subcommand.
    #[arg(long, short, env = "ROOTCA_SERVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "ROOTCA_SERVER_LOG", default_value = "WARN,rootca=INFO")]
    pub log_filter: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run the service.
    ///
    /// The root authority is set up (or loaded) before any connection is accepted. Each
    /// authenticated peer is sent the root certificate in PEM format.
    Listen {},

    /// See the current server configuration.
    Config {},

    /// Perform management tasks on the server.
    #[command(subcommand)]
    Manage(ManagementCommands),
}

#[derive(clap::Subcommand, Debug)]
pub enum ManagementCommands {
    /// Apply any database migrations.
    ///
    /// This should be run on first use to create an empty database. This should also be run after
    /// upgrading to a new version; it is a no-op if no new migrations are available.
    Migrate {},

    /// Set up the root authority without starting the service.
    ///
    /// If another instance is setting up the authority, this waits for it to finish.
    Setup {},

    /// Issue a certificate signed by the root authority.
    ///
    /// The certificate is printed to stdout. Unless a certificate signing request is provided,
    /// a new key is generated as well.
    Issue {
        /// A DNS name for the certificate. The first name is also used as the common name.
        ///
        /// May be given multiple times.
        #[arg(long = "dns")]
        dns_names: Vec<String>,
        /// An IP address for the certificate.
        ///
        /// May be given multiple times.
        #[arg(long = "ip")]
        ip_addresses: Vec<IpAddr>,
        /// The length of time the certificate is valid for in days (starts from the current time).
        #[arg(long, default_value = "365")]
        days: NonZeroU32,
        /// A PEM-encoded certificate signing request to issue the certificate for.
        ///
        /// The names requested in it are included along with any provided on the command line.
        #[arg(long)]
        csr: Option<PathBuf>,
        /// Where to write the generated private key.
        ///
        /// If this is not provided, the key is printed to stdout after the certificate.
        #[arg(long)]
        key_out: Option<PathBuf>,
    },

    /// Revoke a certificate.
    ///
    /// Running instances pick up the revocation the next time they refresh their revocation list.
    Revoke {
        /// The certificate's serial number in hexadecimal.
        ///
        /// Pass an empty string to revoke by common name only.
        serial: String,
        /// Revoke every certificate with this common name.
        #[arg(long)]
        common_name: Option<String>,
    },

    /// Print the root certificate in PEM format.
    CaCertificate {},

    /// View or change the client authentication policy.
    ///
    /// With no options, the current policy is printed. Running instances apply changes to new
    /// connections after they reload the policy.
    Policy {
        /// Require clients to present a certificate.
        #[arg(long)]
        strict: Option<bool>,
        /// Accept client certificates that have expired or are not yet valid.
        #[arg(long)]
        allow_expired: Option<bool>,
    },
}
