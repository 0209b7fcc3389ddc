//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::EndpointId;
use crate::error::Error;

/// Workload view delivered by the cluster watcher. Carries the numeric
/// identity still to be resolved into a label set.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub identity: u64,
    pub ips: Vec<Ipv4Addr>,
}

/// Entry of the pending endpoint events buffer (latest-wins, one per
/// endpoint id).
#[derive(Clone, Debug)]
pub enum EndpointEvent {
    Update(Endpoint),
    Delete(Endpoint),
}

/// Workload view consumed by policy selectors, produced once the endpoint
/// identity has been resolved.
#[derive(Clone, Debug, Eq, PartialEq, new)]
pub struct EndpointMetadata {
    pub id: EndpointId,
    pub labels: BTreeMap<String, String>,
    pub ips: Vec<Ipv4Addr>,
}

// ===== global functions =====

pub(crate) fn endpoint_metadata(
    endpoint: &Endpoint,
    labels: BTreeMap<String, String>,
) -> Result<EndpointMetadata, Error> {
    if endpoint.ips.is_empty() {
        return Err(Error::EndpointMissingIpv4(endpoint.id.clone()));
    }
    Ok(EndpointMetadata::new(
        endpoint.id.clone(),
        labels,
        endpoint.ips.clone(),
    ))
}
