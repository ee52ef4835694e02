// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Parsing of PEM-encoded PKCS#10 certificate signing requests.

use std::net::IpAddr;

use openssl::{
    pkey::{PKey, Public},
    x509::{X509Name, X509Req},
};

use crate::error::CaError;

const PEM_LABELS: [&str; 2] = ["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];

/// The parts of a signing request used for issuance.
pub struct SigningRequest {
    /// The requested subject; issuance copies it verbatim.
    pub subject: X509Name,
    pub public_key: PKey<Public>,
    /// DNS names from the request's subject alternative name extension, in request order.
    pub dns_names: Vec<String>,
    /// IP addresses from the request's subject alternative name extension, in request order.
    pub ip_addresses: Vec<IpAddr>,
}

impl std::fmt::Debug for SigningRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningRequest")
            .field("subject", &&*self.subject)
            .field("public_key", &self.public_key)
            .field("dns_names", &self.dns_names)
            .field("ip_addresses", &self.ip_addresses)
            .finish()
    }
}

/// Decode a PEM certificate signing request and check its self-signature.
///
/// # Errors
///
/// [`CaError::InvalidRequest`] if the input is not a PEM certificate request, its signature
/// does not verify, or its subject alternative names cannot be read.
pub fn parse(csr_pem: &str) -> Result<SigningRequest, CaError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(csr_pem.trim().as_bytes())
        .map_err(|error| CaError::InvalidRequest(format!("not a PEM document: {error}")))?;
    if !PEM_LABELS.contains(&pem.label.as_str()) {
        return Err(CaError::InvalidRequest(format!(
            "expected a CERTIFICATE REQUEST, found a {}",
            pem.label
        )));
    }
    if pem.contents.is_empty() {
        return Err(CaError::InvalidRequest("the request is empty".to_string()));
    }

    let request = X509Req::from_der(&pem.contents)
        .map_err(|error| CaError::InvalidRequest(format!("malformed request: {error}")))?;
    let public_key = request
        .public_key()
        .map_err(|error| CaError::InvalidRequest(format!("unreadable public key: {error}")))?;
    let signed = request
        .verify(&public_key)
        .map_err(|error| CaError::InvalidRequest(format!("unverifiable signature: {error}")))?;
    if !signed {
        return Err(CaError::InvalidRequest(
            "the request is not signed by its own key".to_string(),
        ));
    }
    let subject = request
        .subject_name()
        .to_owned()
        .map_err(CaError::crypto("copying the request subject"))?;
    let (dns_names, ip_addresses) = requested_alt_names(&pem.contents)?;

    Ok(SigningRequest {
        subject,
        public_key,
        dns_names,
        ip_addresses,
    })
}

/// Read the subject alternative names out of the request's extension-request attribute.
fn requested_alt_names(der: &[u8]) -> Result<(Vec<String>, Vec<IpAddr>), CaError> {
    use x509_parser::prelude::*;

    let (_, request) = X509CertificationRequest::from_der(der)
        .map_err(|error| CaError::InvalidRequest(format!("malformed request: {error}")))?;

    let mut dns_names = vec![];
    let mut ip_addresses = vec![];
    for extension in request.requested_extensions().into_iter().flatten() {
        let ParsedExtension::SubjectAlternativeName(alt_names) = extension else {
            continue;
        };
        for name in &alt_names.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                GeneralName::IPAddress(octets) => {
                    let address = super::ip_from_bytes(octets).ok_or_else(|| {
                        CaError::InvalidRequest(format!(
                            "subject alternative name has a {}-byte IP address",
                            octets.len()
                        ))
                    })?;
                    ip_addresses.push(address);
                }
                other => tracing::debug!(?other, "Ignoring unsupported subject alternative name"),
            }
        }
    }
    Ok((dns_names, ip_addresses))
}
