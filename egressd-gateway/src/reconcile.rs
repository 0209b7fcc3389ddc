//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use egressd_utils::ip;
use ipnetwork::Ipv4Network;
use tracing::{debug, error, warn};

use crate::netlink::{
    EGRESS_RULE_PRIORITY, IpRoute, IpRule, RouteTable,
    egress_gateway_routing_table_idx,
};
use crate::policy::GatewayConfig;
use crate::policy_map::{EXCLUDED_CIDR_IPV4, EgressPolicyKey4, PolicyMap};
use crate::{Events, ManagerState, PolicyId};

// Reconciles the policy map and the host routing table against the caches.
// Runs with the manager state locked; per-item failures are logged and the
// remaining items are attempted.
pub(crate) async fn reconcile_locked<P, R>(state: &mut ManagerState<P, R>)
where
    P: PolicyMap,
    R: RouteTable,
{
    if !state.synced {
        return;
    }

    // Refresh the derived indices according to the pending events.
    if state.events.intersects(
        Events::UPDATE_ENDPOINT | Events::DELETE_ENDPOINT | Events::SYNC_DONE,
    ) {
        update_matched_endpoints(state);
        update_policies_by_source_ip(state);
    } else if state
        .events
        .intersects(Events::ADD_POLICY | Events::DELETE_POLICY)
    {
        update_policies_by_source_ip(state);
    }

    regenerate_gateway_configs(state).await;

    if state.install_routes {
        let should_retry = add_missing_ip_rules_and_routes(state, false).await;
        remove_unused_ip_rules_and_routes(state).await;
        if should_retry {
            add_missing_ip_rules_and_routes(state, true).await;
        }
    }

    // Adding missing map entries before removing stale ones keeps every
    // active (source, destination) pair present throughout the update.
    add_missing_egress_entries(state);
    remove_unused_egress_entries(state);

    state.events = Events::empty();
}

// Re-evaluates every policy's endpoint selector against the endpoint store.
fn update_matched_endpoints<P, R>(state: &mut ManagerState<P, R>) {
    let ManagerState {
        policy_configs,
        ep_data_store,
        ..
    } = state;
    for policy in policy_configs.values_mut() {
        policy.update_matched_endpoints(ep_data_store);
    }
}

// Rebuilds the source IP index from scratch.
fn update_policies_by_source_ip<P, R>(state: &mut ManagerState<P, R>) {
    let mut index: HashMap<String, Vec<PolicyId>> = HashMap::new();
    for (policy_id, policy) in &state.policy_configs {
        for endpoint_id in &policy.matched_endpoints {
            let Some(endpoint) = state.ep_data_store.get(endpoint_id) else {
                continue;
            };
            for endpoint_ip in &endpoint.ips {
                index
                    .entry(endpoint_ip.to_string())
                    .or_default()
                    .push(policy_id.clone());
            }
        }
    }
    state.policy_configs_by_source_ip = index;
}

async fn regenerate_gateway_configs<P, R>(state: &mut ManagerState<P, R>)
where
    R: RouteTable,
{
    let ManagerState {
        policy_configs,
        nodes,
        local_node,
        route_table,
        ..
    } = state;
    for policy in policy_configs.values_mut() {
        policy
            .regenerate_gateway_config(nodes, local_node, route_table)
            .await;
    }
}

// Probes the policies matching the given source IP. The callback returns
// true to short-circuit; the return value tells whether any policy matched.
fn policy_matches<P, R>(
    state: &ManagerState<P, R>,
    source_ip: Ipv4Addr,
    f: &mut dyn FnMut(Ipv4Addr, Ipv4Network, bool, &GatewayConfig) -> bool,
) -> bool {
    let Some(policy_ids) =
        state.policy_configs_by_source_ip.get(&source_ip.to_string())
    else {
        return false;
    };
    policy_ids
        .iter()
        .filter_map(|policy_id| state.policy_configs.get(policy_id))
        .any(|policy| {
            policy.for_each_endpoint_and_cidr(&state.ep_data_store, &mut *f)
        })
}

// Like `policy_matches`, but iterating the effective destination CIDRs
// (destinations minus excluded CIDRs).
fn policy_matches_minus_excluded_cidrs<P, R>(
    state: &ManagerState<P, R>,
    source_ip: Ipv4Addr,
    f: &mut dyn FnMut(Ipv4Addr, Ipv4Network) -> bool,
) -> bool {
    let Some(policy_ids) =
        state.policy_configs_by_source_ip.get(&source_ip.to_string())
    else {
        return false;
    };
    policy_ids
        .iter()
        .filter_map(|policy_id| state.policy_configs.get(policy_id))
        .any(|policy| {
            policy
                .for_each_endpoint_and_destination(&state.ep_data_store, &mut *f)
        })
}

// Installs the IP rules and routes required by locally gatewayed policies.
// Returns whether a failed rule add should be retried after the removal
// pass.
async fn add_missing_ip_rules_and_routes<P, R>(
    state: &ManagerState<P, R>,
    is_retry: bool,
) -> bool
where
    R: RouteTable,
{
    let mut should_retry = false;

    for policy in state.policy_configs.values() {
        let gateway_config = &policy.gateway_config;
        if !gateway_config.local_node_configured_as_gateway
            || policy.matched_endpoints.is_empty()
        {
            continue;
        }
        let table =
            egress_gateway_routing_table_idx(gateway_config.iface_index);

        let existing = match state.route_table.rule_list().await {
            Ok(rules) => rules,
            Err(error) => {
                error.log();
                continue;
            }
        };

        let mut pairs = Vec::new();
        policy.for_each_endpoint_and_destination(
            &state.ep_data_store,
            &mut |endpoint_ip, dst_cidr| {
                pairs.push((endpoint_ip, dst_cidr));
                false
            },
        );

        for (endpoint_ip, dst_cidr) in pairs {
            let rule = IpRule::new(
                EGRESS_RULE_PRIORITY,
                ip::host_network(endpoint_ip),
                dst_cidr,
                table,
            );
            if existing.contains(&rule) {
                continue;
            }
            if let Err(error) = state.route_table.rule_add(&rule).await {
                if is_retry {
                    warn!(source_ip = %endpoint_ip,
                        destination_cidr = %dst_cidr, %error,
                        "failed to install ip rule");
                } else {
                    debug!(source_ip = %endpoint_ip,
                        destination_cidr = %dst_cidr, %error,
                        "failed to install ip rule, will retry");
                    should_retry = true;
                }
            }
        }

        if let Err(error) =
            add_egress_ip_routes(&state.route_table, gateway_config).await
        {
            warn!(egress_ip = %gateway_config.egress_ip,
                link_index = gateway_config.iface_index, %error,
                "failed to install egress routes");
        }
    }

    should_retry
}

// Installs the routes of the per-interface egress routing table: a
// connected route for the egress network and a default route via its first
// address.
async fn add_egress_ip_routes<R>(
    route_table: &R,
    gateway_config: &GatewayConfig,
) -> Result<(), crate::error::Error>
where
    R: RouteTable,
{
    let table = egress_gateway_routing_table_idx(gateway_config.iface_index);
    let egress_net = ip::apply_mask(gateway_config.egress_ip);

    route_table
        .route_add(&IpRoute::new(
            table,
            egress_net,
            None,
            gateway_config.iface_index,
        ))
        .await?;

    let gateway = ip::first_host(egress_net);
    route_table
        .route_add(&IpRoute::new(
            table,
            Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).unwrap(),
            Some(gateway),
            gateway_config.iface_index,
        ))
        .await
}

// Deletes the IP rules no policy wants anymore, and the egress routes of
// interfaces that no longer carry any policy.
async fn remove_unused_ip_rules_and_routes<P, R>(state: &ManagerState<P, R>)
where
    R: RouteTable,
{
    let rules = match state.route_table.rule_list().await {
        Ok(rules) => rules,
        Err(error) => {
            error.log();
            return;
        }
    };
    for rule in rules {
        let source_ip = rule.source.ip();
        let in_use = policy_matches_minus_excluded_cidrs(
            state,
            source_ip,
            &mut |endpoint_ip, dst_cidr| {
                rule.source == ip::host_network(endpoint_ip)
                    && rule.dest == dst_cidr
            },
        );
        if !in_use {
            debug!(source_ip = %source_ip, destination_cidr = %rule.dest,
                "removing unused ip rule");
            if let Err(error) = state.route_table.rule_del(&rule).await {
                warn!(source_ip = %source_ip,
                    destination_cidr = %rule.dest, %error,
                    "failed to delete ip rule");
            }
        }
    }

    // Interfaces still carrying at least one locally gatewayed policy keep
    // their egress routing table.
    let mut active_ifaces = HashSet::new();
    for policy in state.policy_configs.values() {
        let gateway_config = &policy.gateway_config;
        if gateway_config.local_node_configured_as_gateway
            && !policy.matched_endpoints.is_empty()
        {
            active_ifaces.insert(gateway_config.iface_index);
        }
    }

    let routes = match state.route_table.route_list().await {
        Ok(routes) => routes,
        Err(error) => {
            error.log();
            return;
        }
    };
    for route in routes {
        if route.table != egress_gateway_routing_table_idx(route.iface_index)
        {
            continue;
        }
        if active_ifaces.contains(&route.iface_index) {
            continue;
        }
        debug!(link_index = route.iface_index, destination = %route.dest,
            "removing unused egress route");
        if let Err(error) = state.route_table.route_del(&route).await {
            warn!(link_index = route.iface_index, %error,
                "failed to delete egress route");
        }
    }
}

// Writes every map entry required by the policies that is missing or
// carries a stale value.
fn add_missing_egress_entries<P, R>(state: &ManagerState<P, R>)
where
    P: PolicyMap,
{
    let mut entries = HashMap::new();
    state.policy_map.iterate_with_callback(&mut |key, val| {
        entries.insert(*key, *val);
    });

    for policy in state.policy_configs.values() {
        policy.for_each_endpoint_and_cidr(
            &state.ep_data_store,
            &mut |endpoint_ip, dst_cidr, excluded, gateway_config| {
                let gateway_ip = if excluded {
                    EXCLUDED_CIDR_IPV4
                } else {
                    gateway_config.gateway_ip
                };
                let egress_ip = gateway_config.egress_ip.ip();

                let key = EgressPolicyKey4::new(endpoint_ip, dst_cidr);
                if entries
                    .get(&key)
                    .is_some_and(|val| val.matches(egress_ip, gateway_ip))
                {
                    return false;
                }

                if let Err(error) = state.policy_map.update(
                    endpoint_ip,
                    dst_cidr,
                    egress_ip,
                    gateway_ip,
                ) {
                    error!(source_ip = %endpoint_ip,
                        destination_cidr = %dst_cidr, egress_ip = %egress_ip,
                        gateway_ip = %gateway_ip, %error,
                        "failed to update egress policy map entry");
                } else {
                    debug!(source_ip = %endpoint_ip,
                        destination_cidr = %dst_cidr, egress_ip = %egress_ip,
                        gateway_ip = %gateway_ip,
                        "updated egress policy map entry");
                }
                false
            },
        );
    }
}

// Deletes the map entries no policy accounts for.
fn remove_unused_egress_entries<P, R>(state: &ManagerState<P, R>)
where
    P: PolicyMap,
{
    let mut entries = Vec::new();
    state.policy_map.iterate_with_callback(&mut |key, val| {
        entries.push((*key, *val));
    });

    for (key, val) in entries {
        let in_use = policy_matches(
            state,
            key.source_ip,
            &mut |endpoint_ip, dst_cidr, excluded, gateway_config| {
                let gateway_ip = if excluded {
                    EXCLUDED_CIDR_IPV4
                } else {
                    gateway_config.gateway_ip
                };
                key.matches(endpoint_ip, dst_cidr)
                    && val.matches(
                        gateway_config.egress_ip.ip(),
                        gateway_ip,
                    )
            },
        );
        if !in_use {
            if let Err(error) =
                state.policy_map.delete(key.source_ip, key.dest_cidr)
            {
                error!(source_ip = %key.source_ip,
                    destination_cidr = %key.dest_cidr, %error,
                    "failed to delete egress policy map entry");
            } else {
                debug!(source_ip = %key.source_ip,
                    destination_cidr = %key.dest_cidr,
                    "removed unused egress policy map entry");
            }
        }
    }
}
