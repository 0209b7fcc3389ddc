//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use derive_new::new;
use ipnetwork::Ipv4Network;

use crate::error::Error;

/// Gateway address placed into map values when no gateway node could be
/// found for the policy.
pub const GATEWAY_NOT_FOUND_IPV4: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

/// Gateway address placed into map values for excluded CIDRs, telling the
/// datapath to skip egress gateway rewriting for the destination.
pub const EXCLUDED_CIDR_IPV4: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

// Minimum kernel version able to host the egress policy map (large
// instruction limit).
const MIN_KERNEL_VERSION: (u64, u64) = (5, 2);

/// Key of an egress policy map entry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, new)]
pub struct EgressPolicyKey4 {
    pub source_ip: Ipv4Addr,
    pub dest_cidr: Ipv4Network,
}

/// Value of an egress policy map entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, new)]
pub struct EgressPolicyVal4 {
    pub egress_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
}

/// Seam to the datapath policy map: the keyed table consulted by the
/// packet-forwarding layer to decide egress gateway behavior per
/// `(source, destination)`.
pub trait PolicyMap: Send + Sync + 'static {
    fn update(
        &self,
        source_ip: Ipv4Addr,
        dest_cidr: Ipv4Network,
        egress_ip: Ipv4Addr,
        gateway_ip: Ipv4Addr,
    ) -> Result<(), Error>;

    fn delete(
        &self,
        source_ip: Ipv4Addr,
        dest_cidr: Ipv4Network,
    ) -> Result<(), Error>;

    fn iterate_with_callback(
        &self,
        cb: &mut dyn FnMut(&EgressPolicyKey4, &EgressPolicyVal4),
    );
}

/// In-memory policy map, standing in for the datapath binding.
#[derive(Debug, Default)]
pub struct PolicyMap4 {
    entries: Mutex<HashMap<EgressPolicyKey4, EgressPolicyVal4>>,
}

// ===== impl EgressPolicyKey4 =====

impl EgressPolicyKey4 {
    /// Compares both the source IP and the destination CIDR, including its
    /// prefix length.
    pub fn matches(&self, source_ip: Ipv4Addr, dest_cidr: Ipv4Network) -> bool {
        self.source_ip == source_ip
            && self.dest_cidr.ip() == dest_cidr.ip()
            && self.dest_cidr.prefix() == dest_cidr.prefix()
    }
}

// ===== impl EgressPolicyVal4 =====

impl EgressPolicyVal4 {
    /// Compares both the egress IP and the gateway IP.
    pub fn matches(&self, egress_ip: Ipv4Addr, gateway_ip: Ipv4Addr) -> bool {
        self.egress_ip == egress_ip && self.gateway_ip == gateway_ip
    }
}

// ===== impl PolicyMap4 =====

impl PolicyMap4 {
    pub fn new() -> PolicyMap4 {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PolicyMap for PolicyMap4 {
    fn update(
        &self,
        source_ip: Ipv4Addr,
        dest_cidr: Ipv4Network,
        egress_ip: Ipv4Addr,
        gateway_ip: Ipv4Addr,
    ) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            EgressPolicyKey4::new(source_ip, dest_cidr),
            EgressPolicyVal4::new(egress_ip, gateway_ip),
        );
        Ok(())
    }

    fn delete(
        &self,
        source_ip: Ipv4Addr,
        dest_cidr: Ipv4Network,
    ) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&EgressPolicyKey4::new(source_ip, dest_cidr));
        Ok(())
    }

    fn iterate_with_callback(
        &self,
        cb: &mut dyn FnMut(&EgressPolicyKey4, &EgressPolicyVal4),
    ) {
        let entries = self.entries.lock().unwrap();
        for (key, val) in entries.iter() {
            cb(key, val);
        }
    }
}

// ===== global functions =====

/// Checks that the running kernel can host the egress policy map. Meant to
/// be called once at startup; a failure is fatal.
pub fn check_kernel_support() -> Result<(), Error> {
    let utsname = nix::sys::utsname::uname()
        .map_err(|errno| Error::UnsupportedKernel(errno.to_string()))?;
    let release = utsname.release().to_string_lossy().into_owned();

    let mut components = release
        .split(['.', '-'])
        .map_while(|component| component.parse::<u64>().ok());
    let major = components.next().unwrap_or(0);
    let minor = components.next().unwrap_or(0);

    if (major, minor) < MIN_KERNEL_VERSION {
        return Err(Error::UnsupportedKernel(release));
    }
    Ok(())
}
