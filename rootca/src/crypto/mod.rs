// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Certificate authority cryptography: the root key pair, request parsing, and issuance.

use std::net::IpAddr;

use openssl::{
    asn1::Asn1Integer,
    bn::{BigNum, MsbOption},
    nid::Nid,
    pkey::{PKey, Private, Public},
    rsa::Rsa,
    x509::{X509Name, X509NameBuilder, X509NameRef, X509Ref, X509},
};

use crate::error::CaError;

pub mod csr;
pub mod issuer;

pub use issuer::{IssuedCertificate, Issuer};

/// The root authority's key pair and self-signed certificate.
///
/// A value of this type always holds a certificate that verifies against its own public key,
/// and a private key that matches that public key.
#[derive(Clone)]
pub struct RootAuthority {
    private_key: PKey<Private>,
    public_key: PKey<Public>,
    certificate: X509,
}

impl std::fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootAuthority")
            .field("subject", &name_to_string(self.certificate.subject_name()))
            .finish_non_exhaustive()
    }
}

impl RootAuthority {
    /// Assemble the root authority from its parts, checking that they belong together.
    pub fn new(
        private_key: PKey<Private>,
        public_key: PKey<Public>,
        certificate: X509,
    ) -> Result<Self, CaError> {
        if !private_key.public_eq(&public_key) {
            return Err(CaError::Configuration(
                "the root private key does not match the root public key".to_string(),
            ));
        }
        let self_signed = certificate
            .verify(&public_key)
            .map_err(CaError::crypto("verifying the root certificate"))?;
        if !self_signed {
            return Err(CaError::Configuration(
                "the root certificate was not signed by the root key".to_string(),
            ));
        }
        Ok(Self {
            private_key,
            public_key,
            certificate,
        })
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    pub fn public_key(&self) -> &PKey<Public> {
        &self.public_key
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// The distinguished name certificates are issued under.
    pub fn issuer_name(&self) -> &X509NameRef {
        self.certificate.subject_name()
    }
}

/// Generate an RSA key pair with a modulus of `bits` bits.
pub fn generate_rsa_key(bits: u32) -> Result<PKey<Private>, CaError> {
    let rsa = Rsa::generate(bits).map_err(CaError::crypto("generating an RSA key"))?;
    PKey::from_rsa(rsa).map_err(CaError::crypto("generating an RSA key"))
}

/// Extract the public half of a key.
pub fn public_key(key: &PKey<Private>) -> Result<PKey<Public>, CaError> {
    let der = key
        .public_key_to_der()
        .map_err(CaError::crypto("encoding a public key"))?;
    PKey::public_key_from_der(&der).map_err(CaError::crypto("decoding a public key"))
}

/// Parse a distinguished name of the form "CN=name,O=organization".
///
/// Attribute names are anything OpenSSL recognizes as a short or long name. Values may not
/// contain commas.
pub fn parse_distinguished_name(dn: &str) -> Result<X509Name, CaError> {
    let mut builder = X509NameBuilder::new().map_err(CaError::crypto("building a name"))?;
    let mut entries = 0;
    for component in dn.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let (field, value) = component.split_once('=').ok_or_else(|| {
            CaError::Configuration(format!(
                "'{component}' in distinguished name '{dn}' is not of the form KEY=VALUE"
            ))
        })?;
        builder
            .append_entry_by_text(field.trim(), value.trim())
            .map_err(|error| {
                CaError::Configuration(format!(
                    "'{component}' in distinguished name '{dn}' is invalid: {error}"
                ))
            })?;
        entries += 1;
    }
    if entries == 0 {
        return Err(CaError::Configuration(format!(
            "distinguished name '{dn}' is empty"
        )));
    }
    Ok(builder.build())
}

/// Render a name as "CN=name,O=organization", the inverse of [`parse_distinguished_name`].
pub fn name_to_string(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let field = entry.object().nid().short_name().unwrap_or("UNKNOWN");
            let value = entry
                .data()
                .as_utf8()
                .map(|value| value.to_string())
                .unwrap_or_default();
            format!("{field}={value}")
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// A random, positive 159-bit serial number.
pub(crate) fn random_serial() -> Result<Asn1Integer, CaError> {
    let mut serial = BigNum::new().map_err(CaError::crypto("generating a serial number"))?;
    serial
        .rand(159, MsbOption::MAYBE_ZERO, false)
        .map_err(CaError::crypto("generating a serial number"))?;
    serial
        .to_asn1_integer()
        .map_err(CaError::crypto("generating a serial number"))
}

/// A certificate's serial number as upper-case hexadecimal.
pub fn serial_hex(certificate: &X509Ref) -> Result<String, CaError> {
    let serial = certificate
        .serial_number()
        .to_bn()
        .map_err(CaError::crypto("reading a serial number"))?;
    let hex = serial
        .to_hex_str()
        .map_err(CaError::crypto("reading a serial number"))?;
    Ok(hex.to_string())
}

/// The first common name in the certificate's subject, if any.
pub fn common_name(certificate: &X509Ref) -> Option<String> {
    certificate
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|name| name.to_string())
}

/// The DNS names and IP addresses in the certificate's subject alternative names.
pub fn subject_alt_names(certificate: &X509Ref) -> (Vec<String>, Vec<IpAddr>) {
    let mut dns_names = vec![];
    let mut ip_addresses = vec![];
    for name in certificate.subject_alt_names().into_iter().flatten() {
        if let Some(dns) = name.dnsname() {
            dns_names.push(dns.to_string());
        } else if let Some(ip) = name.ipaddress().and_then(ip_from_bytes) {
            ip_addresses.push(ip);
        }
    }
    (dns_names, ip_addresses)
}

/// Convert the octets of an IP address general name.
pub(crate) fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
        Some(IpAddr::from(v4))
    } else if let Ok(v6) = <[u8; 16]>::try_from(bytes) {
        Some(IpAddr::from(v6))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinguished_names() -> anyhow::Result<()> {
        let name = parse_distinguished_name("CN=ca.example, O=Example Org ,OU=Infra")?;
        assert_eq!(name_to_string(&name), "CN=ca.example,O=Example Org,OU=Infra");

        assert!(matches!(
            parse_distinguished_name("ca.example"),
            Err(CaError::Configuration(_))
        ));
        assert!(matches!(
            parse_distinguished_name(" , "),
            Err(CaError::Configuration(_))
        ));
        assert!(matches!(
            parse_distinguished_name("NOTAFIELD=x"),
            Err(CaError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn serials_are_positive_and_distinct() -> anyhow::Result<()> {
        let first = random_serial()?.to_bn()?;
        let second = random_serial()?.to_bn()?;
        assert!(!first.is_negative());
        assert!(first.num_bits() <= 159);
        assert_ne!(first, second);
        Ok(())
    }

    #[test]
    fn ip_octets() {
        assert_eq!(ip_from_bytes(&[10, 0, 0, 5]), Some(IpAddr::from([10, 0, 0, 5])));
        assert_eq!(
            ip_from_bytes(&[0; 16]),
            Some(IpAddr::from(std::net::Ipv6Addr::UNSPECIFIED))
        );
        assert_eq!(ip_from_bytes(&[1, 2, 3]), None);
    }

    #[test]
    fn mismatched_root_parts_are_rejected() -> anyhow::Result<()> {
        let key = generate_rsa_key(2048)?;
        let other = generate_rsa_key(2048)?;
        let name = parse_distinguished_name("CN=root")?;
        let certificate =
            issuer::self_signed(&key, &name, 1, openssl::hash::MessageDigest::sha256())?;

        RootAuthority::new(key.clone(), public_key(&key)?, certificate.clone())?;
        assert!(matches!(
            RootAuthority::new(key.clone(), public_key(&other)?, certificate.clone()),
            Err(CaError::Configuration(_))
        ));
        assert!(matches!(
            RootAuthority::new(other.clone(), public_key(&other)?, certificate),
            Err(CaError::Configuration(_))
        ));
        Ok(())
    }
}
