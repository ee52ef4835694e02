// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Discovery of the local host name and addresses placed in the management certificate.

use std::{
    collections::BTreeSet,
    net::{IpAddr, SocketAddrV4, SocketAddrV6},
};

use ipnet::IpNet;
use nix::net::if_::InterfaceFlags;

use crate::error::CaError;

/// An address assigned to a local network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub address: IpAddr,
    pub loopback: bool,
}

/// A source of local network details.
pub trait NetworkDiscovery: Send + Sync {
    /// Addresses on every interface that is up.
    fn interface_addresses(&self) -> Result<Vec<InterfaceAddress>, CaError>;

    /// The local host name.
    fn hostname(&self) -> Result<String, CaError>;
}

/// Reads the host's actual interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNetwork;

impl NetworkDiscovery for SystemNetwork {
    fn interface_addresses(&self) -> Result<Vec<InterfaceAddress>, CaError> {
        let interfaces = nix::ifaddrs::getifaddrs().map_err(|error| {
            CaError::Configuration(format!("failed to enumerate network interfaces: {error}"))
        })?;
        let mut addresses = vec![];
        for interface in interfaces {
            if !interface.flags.contains(InterfaceFlags::IFF_UP) {
                continue;
            }
            let Some(storage) = interface.address else {
                continue;
            };
            let address = if let Some(v4) = storage.as_sockaddr_in() {
                IpAddr::V4(*SocketAddrV4::from(*v4).ip())
            } else if let Some(v6) = storage.as_sockaddr_in6() {
                IpAddr::V6(*SocketAddrV6::from(*v6).ip())
            } else {
                continue;
            };
            addresses.push(InterfaceAddress {
                address,
                loopback: interface.flags.contains(InterfaceFlags::IFF_LOOPBACK),
            });
        }
        Ok(addresses)
    }

    fn hostname(&self) -> Result<String, CaError> {
        hostname::get()
            .map_err(|error| CaError::Configuration(format!("failed to read the host name: {error}")))?
            .into_string()
            .map_err(|name| CaError::Configuration(format!("host name {name:?} is not valid UTF-8")))
    }
}

/// The addresses to name in the management certificate.
///
/// This is every routable address on a non-loopback interface, plus any local address inside
/// `management_network`. Link-local addresses are skipped since they are meaningless without
/// an interface scope.
pub fn candidate_addresses(
    network: &dyn NetworkDiscovery,
    management_network: Option<&IpNet>,
) -> Result<BTreeSet<IpAddr>, CaError> {
    let interfaces = network.interface_addresses()?;
    let candidates = interfaces
        .iter()
        .filter(|interface| {
            let in_management_network =
                management_network.is_some_and(|net| net.contains(&interface.address));
            in_management_network || (!interface.loopback && !is_link_local(&interface.address))
        })
        .map(|interface| interface.address)
        .collect();
    Ok(candidates)
}

fn is_link_local(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::str::FromStr;

    use proptest::prelude::*;

    use super::*;

    /// A fixed set of interfaces for tests.
    #[derive(Debug, Clone)]
    pub(crate) struct FixedNetwork {
        pub hostname: String,
        pub addresses: Vec<InterfaceAddress>,
    }

    impl NetworkDiscovery for FixedNetwork {
        fn interface_addresses(&self) -> Result<Vec<InterfaceAddress>, CaError> {
            Ok(self.addresses.clone())
        }

        fn hostname(&self) -> Result<String, CaError> {
            Ok(self.hostname.clone())
        }
    }

    fn interface(address: &str, loopback: bool) -> InterfaceAddress {
        InterfaceAddress {
            address: IpAddr::from_str(address).expect("test addresses are valid"),
            loopback,
        }
    }

    #[test]
    fn loopback_only_when_in_management_network() -> anyhow::Result<()> {
        let network = FixedNetwork {
            hostname: "ca".into(),
            addresses: vec![
                interface("127.0.0.1", true),
                interface("::1", true),
                interface("192.0.2.10", false),
                interface("fe80::1", false),
                interface("169.254.1.1", false),
                interface("2001:db8::10", false),
            ],
        };

        let candidates = candidate_addresses(&network, None)?;
        let expected: BTreeSet<IpAddr> = ["192.0.2.10", "2001:db8::10"]
            .into_iter()
            .map(IpAddr::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(candidates, expected);

        let loopback_net = IpNet::from_str("127.0.0.0/8")?;
        let candidates = candidate_addresses(&network, Some(&loopback_net))?;
        assert!(candidates.contains(&IpAddr::from_str("127.0.0.1")?));
        assert!(!candidates.contains(&IpAddr::from_str("::1")?));
        Ok(())
    }

    #[test]
    fn system_network_enumerates() -> anyhow::Result<()> {
        let addresses = SystemNetwork.interface_addresses()?;
        // Every Linux host, container or not, has an up loopback interface.
        assert!(addresses.iter().any(|interface| interface.loopback));
        assert!(!SystemNetwork.hostname()?.is_empty());
        Ok(())
    }

    proptest! {
        // Each address appears once no matter how many interfaces carry it.
        #[test]
        fn candidates_are_deduplicated(octets in proptest::collection::vec(1u8..=254, 1..16)) {
            let addresses = octets
                .iter()
                .flat_map(|octet| {
                    let address = InterfaceAddress {
                        address: IpAddr::from([10, 0, 0, *octet]),
                        loopback: false,
                    };
                    [address, address]
                })
                .collect();
            let network = FixedNetwork { hostname: "ca".into(), addresses };
            let candidates = candidate_addresses(&network, None).unwrap();
            let unique: BTreeSet<u8> = octets.into_iter().collect();
            prop_assert_eq!(candidates.len(), unique.len());
        }
    }
}
