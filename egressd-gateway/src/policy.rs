//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use derive_new::new;
use egressd_utils::ip;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::endpoint::EndpointMetadata;
use crate::error::Error;
use crate::netlink::{LinkInfo, RouteTable};
use crate::node::Node;
use crate::policy_map::GATEWAY_NOT_FOUND_IPV4;
use crate::{EndpointId, PolicyId};

/// Label selector with match-labels semantics: a label set matches when it
/// contains every selector label with the same value.
#[derive(Clone, Debug, Default, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

/// Resolved per-policy routing intent, recomputed on every reconciliation
/// pass from the policy spec and the current node set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GatewayConfig {
    // Egress address and prefix on the local egress interface.
    pub egress_ip: Ipv4Network,
    // Local interface carrying the egress IP.
    pub iface_index: u32,
    // Address placed into the datapath map values.
    pub gateway_ip: Ipv4Addr,
    // Whether the local node is the gateway for this policy.
    pub local_node_configured_as_gateway: bool,
}

/// One installed egress policy.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub id: PolicyId,
    #[serde(default)]
    pub endpoint_selector: LabelSelector,
    #[serde(default)]
    pub node_selector: LabelSelector,
    #[serde(default)]
    pub egress_iface: Option<String>,
    #[serde(default)]
    pub egress_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub dst_cidrs: Vec<Ipv4Network>,
    #[serde(default)]
    pub excluded_cidrs: Vec<Ipv4Network>,
    #[serde(skip)]
    pub matched_endpoints: Vec<EndpointId>,
    #[serde(skip)]
    pub gateway_config: GatewayConfig,
}

// ===== impl LabelSelector =====

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

// ===== impl GatewayConfig =====

impl Default for GatewayConfig {
    fn default() -> GatewayConfig {
        GatewayConfig {
            egress_ip: Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).unwrap(),
            iface_index: 0,
            gateway_ip: GATEWAY_NOT_FOUND_IPV4,
            local_node_configured_as_gateway: false,
        }
    }
}

// ===== impl PolicyConfig =====

impl PolicyConfig {
    /// Re-evaluates the endpoint selector against the endpoint store,
    /// refreshing the set of matched endpoints.
    pub(crate) fn update_matched_endpoints(
        &mut self,
        endpoints: &HashMap<EndpointId, EndpointMetadata>,
    ) {
        let mut matched = endpoints
            .values()
            .filter(|endpoint| self.endpoint_selector.matches(&endpoint.labels))
            .map(|endpoint| endpoint.id.clone())
            .collect::<Vec<_>>();
        matched.sort();
        self.matched_endpoints = matched;
    }

    /// Returns the effective destination CIDRs: every destination CIDR with
    /// the excluded CIDRs subtracted.
    pub fn destination_minus_excluded_cidrs(&self) -> Vec<Ipv4Network> {
        self.dst_cidrs
            .iter()
            .flat_map(|dst_cidr| ip::remove_cidrs(*dst_cidr, &self.excluded_cidrs))
            .collect()
    }

    /// Invokes the callback over every `(endpoint IP, CIDR)` pair of the
    /// policy, covering both destination CIDRs (excluded = false) and
    /// excluded CIDRs (excluded = true). The callback returns true to
    /// short-circuit; the return value tells whether it did.
    pub(crate) fn for_each_endpoint_and_cidr(
        &self,
        endpoints: &HashMap<EndpointId, EndpointMetadata>,
        f: &mut dyn FnMut(Ipv4Addr, Ipv4Network, bool, &GatewayConfig) -> bool,
    ) -> bool {
        for endpoint_id in &self.matched_endpoints {
            let Some(endpoint) = endpoints.get(endpoint_id) else {
                continue;
            };
            for endpoint_ip in &endpoint.ips {
                for dst_cidr in &self.dst_cidrs {
                    if f(*endpoint_ip, *dst_cidr, false, &self.gateway_config) {
                        return true;
                    }
                }
                for excluded_cidr in &self.excluded_cidrs {
                    if f(
                        *endpoint_ip,
                        *excluded_cidr,
                        true,
                        &self.gateway_config,
                    ) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Invokes the callback over every `(endpoint IP, effective destination
    /// CIDR)` pair of the policy. The callback returns true to
    /// short-circuit.
    pub(crate) fn for_each_endpoint_and_destination(
        &self,
        endpoints: &HashMap<EndpointId, EndpointMetadata>,
        f: &mut dyn FnMut(Ipv4Addr, Ipv4Network) -> bool,
    ) -> bool {
        let destinations = self.destination_minus_excluded_cidrs();
        for endpoint_id in &self.matched_endpoints {
            let Some(endpoint) = endpoints.get(endpoint_id) else {
                continue;
            };
            for endpoint_ip in &endpoint.ips {
                for dst_cidr in &destinations {
                    if f(*endpoint_ip, *dst_cidr) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Recomputes the gateway config from the policy spec and the current
    /// node set. Nodes must be sorted by name so that gateway selection is
    /// deterministic across the cluster.
    pub(crate) async fn regenerate_gateway_config<R>(
        &mut self,
        nodes: &[Node],
        local_node: &str,
        route_table: &R,
    ) where
        R: RouteTable,
    {
        let mut gateway_config = GatewayConfig::default();

        if let Some(gateway_node) = nodes
            .iter()
            .find(|node| self.node_selector.matches(&node.labels))
        {
            gateway_config.gateway_ip = gateway_node.addr;

            if gateway_node.name == local_node {
                match self.resolve_egress_iface(route_table).await {
                    Ok(Some(LinkInfo {
                        index,
                        address: Some(address),
                        ..
                    })) => {
                        gateway_config.egress_ip = address;
                        gateway_config.iface_index = index;
                        gateway_config.local_node_configured_as_gateway = true;
                    }
                    Ok(_) => {
                        warn!(policy = %self.id,
                            "failed to resolve egress interface");
                    }
                    Err(error) => {
                        warn!(policy = %self.id, %error,
                            "failed to resolve egress interface");
                    }
                }
            }
        }

        self.gateway_config = gateway_config;
    }

    // Resolves the local egress interface, either by its configured name or
    // by the link carrying the configured egress IP.
    async fn resolve_egress_iface<R>(
        &self,
        route_table: &R,
    ) -> Result<Option<LinkInfo>, Error>
    where
        R: RouteTable,
    {
        if let Some(iface_name) = &self.egress_iface {
            return route_table.link_by_name(iface_name).await;
        }
        if let Some(egress_ip) = self.egress_ip {
            return route_table.link_by_address(egress_ip).await;
        }
        Ok(None)
    }
}
