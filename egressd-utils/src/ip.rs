//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

/// Returns the host (/32) network of the given address.
pub fn host_network(addr: Ipv4Addr) -> Ipv4Network {
    Ipv4Network::new(addr, 32).unwrap()
}

/// Returns the network with its host bits cleared.
pub fn apply_mask(network: Ipv4Network) -> Ipv4Network {
    Ipv4Network::new(network.network(), network.prefix()).unwrap()
}

/// Returns the first host address of the given network.
pub fn first_host(network: Ipv4Network) -> Ipv4Addr {
    let base = u32::from(network.network());
    Ipv4Addr::from(base.saturating_add(1))
}

/// Subtracts a list of CIDRs from the given CIDR, returning the remaining
/// address space as a minimal, ascending list of CIDRs.
pub fn remove_cidrs(
    from: Ipv4Network,
    excluded: &[Ipv4Network],
) -> Vec<Ipv4Network> {
    let mut result = vec![apply_mask(from)];
    for excluded in excluded {
        result = result
            .into_iter()
            .flat_map(|cidr| remove_cidr(cidr, apply_mask(*excluded)))
            .collect();
    }
    result
}

// Subtracts a single CIDR by recursively splitting the enclosing network.
fn remove_cidr(from: Ipv4Network, excluded: Ipv4Network) -> Vec<Ipv4Network> {
    if from.is_subnet_of(excluded) {
        return vec![];
    }
    if !from.overlaps(excluded) {
        return vec![from];
    }

    // The excluded CIDR is a strict subnet: split into halves and recurse.
    let prefix = from.prefix() + 1;
    let lower = Ipv4Network::new(from.network(), prefix).unwrap();
    let upper_base = u32::from(from.network()) | (1 << (32 - prefix));
    let upper = Ipv4Network::new(Ipv4Addr::from(upper_base), prefix).unwrap();

    [lower, upper]
        .into_iter()
        .flat_map(|half| remove_cidr(half, excluded))
        .collect()
}
