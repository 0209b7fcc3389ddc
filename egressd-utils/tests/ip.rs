//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use egressd_utils::ip::{first_host, host_network, remove_cidrs};
use ipnetwork::Ipv4Network;

fn net(cidr: &str) -> Ipv4Network {
    cidr.parse().unwrap()
}

fn nets(cidrs: &[&str]) -> Vec<Ipv4Network> {
    cidrs.iter().map(|cidr| net(cidr)).collect()
}

#[test]
fn host_network_is_a_slash_32() {
    assert_eq!(host_network("10.0.0.5".parse().unwrap()), net("10.0.0.5/32"));
}

#[test]
fn first_host_follows_the_network_address() {
    assert_eq!(
        first_host(net("192.0.2.0/24")),
        "192.0.2.1".parse::<std::net::Ipv4Addr>().unwrap()
    );
}

#[test]
fn remove_nothing_returns_the_original() {
    assert_eq!(remove_cidrs(net("1.2.0.0/16"), &[]), nets(&["1.2.0.0/16"]));
}

#[test]
fn remove_disjoint_cidr_is_a_noop() {
    assert_eq!(
        remove_cidrs(net("1.2.0.0/16"), &nets(&["9.9.9.0/24"])),
        nets(&["1.2.0.0/16"])
    );
}

#[test]
fn remove_covering_cidr_leaves_nothing() {
    assert!(remove_cidrs(net("1.2.3.0/24"), &nets(&["1.2.0.0/16"])).is_empty());
    assert!(remove_cidrs(net("1.2.3.0/24"), &nets(&["1.2.3.0/24"])).is_empty());
}

#[test]
fn remove_subnet_splits_the_network() {
    assert_eq!(
        remove_cidrs(net("1.2.0.0/16"), &nets(&["1.2.3.0/24"])),
        nets(&[
            "1.2.0.0/23",
            "1.2.2.0/24",
            "1.2.4.0/22",
            "1.2.8.0/21",
            "1.2.16.0/20",
            "1.2.32.0/19",
            "1.2.64.0/18",
            "1.2.128.0/17",
        ])
    );
}

#[test]
fn remove_multiple_cidrs_composes() {
    let result = remove_cidrs(
        net("10.0.0.0/8"),
        &nets(&["10.0.0.0/9", "10.128.0.0/10"]),
    );
    assert_eq!(result, nets(&["10.192.0.0/10"]));
}

#[test]
fn remove_single_address() {
    assert_eq!(
        remove_cidrs(net("10.0.0.0/30"), &nets(&["10.0.0.2/32"])),
        nets(&["10.0.0.0/31", "10.0.0.3/32"])
    );
}
