// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Certificate issuance under the root authority.

use std::net::IpAddr;

use openssl::{
    asn1::{Asn1Time, Asn1TimeRef},
    hash::MessageDigest,
    pkey::{PKey, PKeyRef, Private, Public},
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        X509Builder, X509Name, X509NameRef, X509Ref, X509,
    },
};
use tracing::instrument;

use super::{csr, generate_rsa_key, public_key, random_serial, serial_hex, RootAuthority};
use crate::{config::Config, error::CaError};

/// A certificate issued by the root authority.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certificate: X509,
    /// The generated private key; absent when issuing for a signing request.
    pub private_key: Option<PKey<Private>>,
    /// The chain up to and including the root certificate.
    pub ca_chain: Vec<X509>,
}

impl IssuedCertificate {
    /// The certificate's serial number as upper-case hexadecimal.
    pub fn serial(&self) -> Result<String, CaError> {
        serial_hex(&self.certificate)
    }

    pub fn certificate_pem(&self) -> Result<String, CaError> {
        pem_string(self.certificate.to_pem(), "encoding a certificate")
    }

    /// The PKCS#8 private key in PEM form, if this issuance generated one.
    pub fn private_key_pem(&self) -> Result<Option<String>, CaError> {
        self.private_key
            .as_ref()
            .map(|key| pem_string(key.private_key_to_pem_pkcs8(), "encoding a private key"))
            .transpose()
    }
}

/// Issues leaf certificates signed by the root key.
pub struct Issuer<'a> {
    root: &'a RootAuthority,
    digest: MessageDigest,
    key_size: u32,
}

impl<'a> Issuer<'a> {
    pub fn new(root: &'a RootAuthority, config: &Config) -> Result<Self, CaError> {
        Ok(Self {
            root,
            digest: config.digest()?,
            key_size: config.certificate_key_size,
        })
    }

    /// Generate a key pair and a certificate for it naming `dns_names` and `ip_addresses`.
    ///
    /// The subject's common name is the first DNS name.
    ///
    /// # Errors
    ///
    /// [`CaError::Configuration`] if there is no DNS name, or the first one is empty.
    #[instrument(skip(self), err)]
    pub fn issue(
        &self,
        dns_names: &[String],
        ip_addresses: &[IpAddr],
        validity_days: u32,
    ) -> Result<IssuedCertificate, CaError> {
        let common_name = dns_names
            .first()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                CaError::Configuration("a non-empty DNS name is required".to_string())
            })?;
        let private_key = generate_rsa_key(self.key_size)?;
        let subject = super::parse_distinguished_name(&format!("CN={common_name}"))?;
        let (not_before, not_after) = validity_window(validity_days)?;
        let certificate = self.sign(
            &*public_key(&private_key)?,
            &subject,
            dns_names,
            ip_addresses,
            &not_before,
            &not_after,
        )?;
        tracing::info!(
            %common_name,
            serial = %serial_hex(&certificate)?,
            validity_days,
            "Issued certificate"
        );
        Ok(IssuedCertificate {
            certificate,
            private_key: Some(private_key),
            ca_chain: vec![self.root.certificate().clone()],
        })
    }

    /// Issue a certificate for the key in a PEM signing request.
    ///
    /// The request's subject is kept and its subject alternative names are combined with
    /// `dns_names` and `ip_addresses`, dropping duplicates.
    #[instrument(skip(self, csr_pem), err)]
    pub fn issue_from_csr(
        &self,
        csr_pem: &str,
        dns_names: &[String],
        ip_addresses: &[IpAddr],
        validity_days: u32,
    ) -> Result<IssuedCertificate, CaError> {
        let request = csr::parse(csr_pem)?;
        let dns_names = union(request.dns_names, dns_names);
        let ip_addresses = union(request.ip_addresses, ip_addresses);
        let (not_before, not_after) = validity_window(validity_days)?;
        let certificate = self.sign(
            &request.public_key,
            &request.subject,
            &dns_names,
            &ip_addresses,
            &not_before,
            &not_after,
        )?;
        tracing::info!(
            subject = %super::name_to_string(&request.subject),
            serial = %serial_hex(&certificate)?,
            validity_days,
            "Issued certificate for signing request"
        );
        Ok(IssuedCertificate {
            certificate,
            private_key: None,
            ca_chain: vec![self.root.certificate().clone()],
        })
    }

    /// Build and sign a leaf certificate.
    pub(crate) fn sign(
        &self,
        subject_key: &PKeyRef<Public>,
        subject: &X509NameRef,
        dns_names: &[String],
        ip_addresses: &[IpAddr],
        not_before: &Asn1TimeRef,
        not_after: &Asn1TimeRef,
    ) -> Result<X509, CaError> {
        let context = "signing a certificate";
        let root: &X509Ref = self.root.certificate();
        let mut builder = X509Builder::new().map_err(CaError::crypto(context))?;
        builder.set_version(2).map_err(CaError::crypto(context))?;
        builder
            .set_serial_number(&*random_serial()?)
            .map_err(CaError::crypto(context))?;
        builder
            .set_subject_name(subject)
            .map_err(CaError::crypto(context))?;
        builder
            .set_issuer_name(self.root.issuer_name())
            .map_err(CaError::crypto(context))?;
        builder
            .set_pubkey(subject_key)
            .map_err(CaError::crypto(context))?;
        builder
            .set_not_before(not_before)
            .map_err(CaError::crypto(context))?;
        builder
            .set_not_after(not_after)
            .map_err(CaError::crypto(context))?;

        let extensions = [
            BasicConstraints::new().critical().build(),
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build(),
            ExtendedKeyUsage::new().server_auth().client_auth().build(),
        ];
        for extension in extensions {
            builder
                .append_extension(extension.map_err(CaError::crypto(context))?)
                .map_err(CaError::crypto(context))?;
        }

        let subject_key_id = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(root), None))
            .map_err(CaError::crypto(context))?;
        builder
            .append_extension(subject_key_id)
            .map_err(CaError::crypto(context))?;
        let authority_key_id = AuthorityKeyIdentifier::new()
            .keyid(false)
            .issuer(false)
            .build(&builder.x509v3_context(Some(root), None))
            .map_err(CaError::crypto(context))?;
        builder
            .append_extension(authority_key_id)
            .map_err(CaError::crypto(context))?;

        if !dns_names.is_empty() || !ip_addresses.is_empty() {
            let mut alt_names = SubjectAlternativeName::new();
            for name in dns_names {
                alt_names.dns(name);
            }
            for address in ip_addresses {
                alt_names.ip(&address.to_string());
            }
            let alt_names = alt_names
                .build(&builder.x509v3_context(Some(root), None))
                .map_err(CaError::crypto(context))?;
            builder
                .append_extension(alt_names)
                .map_err(CaError::crypto(context))?;
        }

        builder
            .sign(self.root.private_key(), self.digest)
            .map_err(CaError::crypto(context))?;
        Ok(builder.build())
    }
}

/// Create the self-signed root certificate for `key`.
pub fn self_signed(
    key: &PKey<Private>,
    name: &X509Name,
    validity_days: u32,
    digest: MessageDigest,
) -> Result<X509, CaError> {
    let context = "creating the root certificate";
    let mut builder = X509Builder::new().map_err(CaError::crypto(context))?;
    builder.set_version(2).map_err(CaError::crypto(context))?;
    builder
        .set_serial_number(&*random_serial()?)
        .map_err(CaError::crypto(context))?;
    builder.set_subject_name(name).map_err(CaError::crypto(context))?;
    builder.set_issuer_name(name).map_err(CaError::crypto(context))?;
    builder.set_pubkey(key).map_err(CaError::crypto(context))?;
    let (not_before, not_after) = validity_window(validity_days)?;
    builder
        .set_not_before(&not_before)
        .map_err(CaError::crypto(context))?;
    builder
        .set_not_after(&not_after)
        .map_err(CaError::crypto(context))?;

    let extensions = [
        BasicConstraints::new().critical().ca().build(),
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .build(),
    ];
    for extension in extensions {
        builder
            .append_extension(extension.map_err(CaError::crypto(context))?)
            .map_err(CaError::crypto(context))?;
    }
    let subject_key_id = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(None, None))
        .map_err(CaError::crypto(context))?;
    builder
        .append_extension(subject_key_id)
        .map_err(CaError::crypto(context))?;

    builder.sign(key, digest).map_err(CaError::crypto(context))?;
    Ok(builder.build())
}

fn validity_window(validity_days: u32) -> Result<(Asn1Time, Asn1Time), CaError> {
    let not_before = Asn1Time::days_from_now(0).map_err(CaError::crypto("computing validity"))?;
    let not_after =
        Asn1Time::days_from_now(validity_days).map_err(CaError::crypto("computing validity"))?;
    Ok((not_before, not_after))
}

fn pem_string(
    pem: Result<Vec<u8>, openssl::error::ErrorStack>,
    context: &'static str,
) -> Result<String, CaError> {
    let pem = pem.map_err(CaError::crypto(context))?;
    String::from_utf8(pem).map_err(|_| CaError::Configuration(format!("{context}: PEM is not UTF-8")))
}

/// `first` followed by the items of `extra` it does not already contain.
fn union<T: Clone + PartialEq>(mut first: Vec<T>, extra: &[T]) -> Vec<T> {
    for item in extra {
        if !first.contains(item) {
            first.push(item.clone());
        }
    }
    first
}
