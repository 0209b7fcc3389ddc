//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};

use capctl::caps::CapState;
use derive_new::new;
use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::{Handle, IpVersion, new_connection};
use tracing::error;

use crate::error::Error;

/// Priority shared by every IP rule owned by the egress gateway subsystem,
/// used to enumerate them.
pub const EGRESS_RULE_PRIORITY: u32 = 8;

// Base of the per-interface routing table range owned by the egress gateway
// subsystem.
const ROUTE_TABLE_EGRESS_OFFSET: u32 = 300;

/// An IP rule steering an endpoint/destination pair into a per-interface
/// egress routing table.
#[derive(Clone, Debug, Eq, PartialEq, new)]
pub struct IpRule {
    pub priority: u32,
    pub source: Ipv4Network,
    pub dest: Ipv4Network,
    pub table: u32,
}

/// An IPv4 route on a numbered routing table.
#[derive(Clone, Debug, Eq, PartialEq, new)]
pub struct IpRoute {
    pub table: u32,
    pub dest: Ipv4Network,
    pub gateway: Option<Ipv4Addr>,
    pub iface_index: u32,
}

/// A network interface, along with one of its IPv4 addresses: the first one
/// when looked up by name, the matching one when looked up by address.
#[derive(Clone, Debug, Eq, PartialEq, new)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub address: Option<Ipv4Network>,
}

/// Seam to the host routing table: IP rules and routes on numbered routing
/// tables, plus the link lookups needed to resolve egress interfaces.
pub trait RouteTable: Send + Sync + 'static {
    fn link_by_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<LinkInfo>, Error>> + Send;

    fn link_by_address(
        &self,
        addr: Ipv4Addr,
    ) -> impl Future<Output = Result<Option<LinkInfo>, Error>> + Send;

    /// Lists the IP rules owned by the egress gateway subsystem.
    fn rule_list(
        &self,
    ) -> impl Future<Output = Result<Vec<IpRule>, Error>> + Send;

    fn rule_add(
        &self,
        rule: &IpRule,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn rule_del(
        &self,
        rule: &IpRule,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Lists all IPv4 routes, across all routing tables.
    fn route_list(
        &self,
    ) -> impl Future<Output = Result<Vec<IpRoute>, Error>> + Send;

    /// Adds a route, replacing any existing route with the same key.
    fn route_add(
        &self,
        route: &IpRoute,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn route_del(
        &self,
        route: &IpRoute,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Kernel-backed route table speaking rtnetlink.
#[derive(Clone, Debug)]
pub struct NetlinkRouteTable {
    handle: Handle,
}

// ===== impl NetlinkRouteTable =====

impl NetlinkRouteTable {
    async fn link_name(&self, index: u32) -> Option<String> {
        let mut links = self.handle.link().get().match_index(index).execute();
        let msg = links.try_next().await.ok()??;
        msg.attributes.into_iter().find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name),
            _ => None,
        })
    }

    // Returns the first IPv4 address assigned to the given link.
    async fn link_first_address(
        &self,
        index: u32,
    ) -> Result<Option<Ipv4Network>, Error> {
        let mut addresses = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(msg) =
            addresses.try_next().await.map_err(netlink_error)?
        {
            if msg.header.family != AddressFamily::Inet {
                continue;
            }
            for attr in &msg.attributes {
                if let AddressAttribute::Address(IpAddr::V4(addr)) = attr
                    && let Ok(network) =
                        Ipv4Network::new(*addr, msg.header.prefix_len)
                {
                    return Ok(Some(network));
                }
            }
        }
        Ok(None)
    }

    // Builds the netlink request matching the given rule.
    fn rule_request(&self, rule: &IpRule) -> rtnetlink::RuleAddRequest<Ipv4Addr> {
        self.handle
            .rule()
            .add()
            .v4()
            .priority(rule.priority)
            .table_id(rule.table)
            .source_prefix(rule.source.ip(), rule.source.prefix())
            .destination_prefix(rule.dest.ip(), rule.dest.prefix())
            .action(RuleAction::ToTable)
    }

    // Builds the netlink request matching the given route.
    fn route_request(
        &self,
        route: &IpRoute,
    ) -> rtnetlink::RouteAddRequest<Ipv4Addr> {
        let mut request = self
            .handle
            .route()
            .add()
            .v4()
            .table_id(route.table)
            .destination_prefix(route.dest.ip(), route.dest.prefix())
            .output_interface(route.iface_index);
        if let Some(gateway) = route.gateway {
            request = request.gateway(gateway);
        }
        request
    }
}

impl RouteTable for NetlinkRouteTable {
    async fn link_by_name(
        &self,
        name: &str,
    ) -> Result<Option<LinkInfo>, Error> {
        let mut links =
            self.handle.link().get().match_name(name.to_owned()).execute();
        let msg = match links.try_next().await {
            Ok(Some(msg)) => msg,
            // A nonexistent link name yields an error rather than an empty
            // dump.
            Ok(None) | Err(_) => return Ok(None),
        };
        let index = msg.header.index;
        let address = self.link_first_address(index).await?;
        Ok(Some(LinkInfo::new(index, name.to_owned(), address)))
    }

    async fn link_by_address(
        &self,
        addr: Ipv4Addr,
    ) -> Result<Option<LinkInfo>, Error> {
        let mut addresses = self.handle.address().get().execute();
        while let Some(msg) =
            addresses.try_next().await.map_err(netlink_error)?
        {
            if msg.header.family != AddressFamily::Inet {
                continue;
            }
            for attr in &msg.attributes {
                if let AddressAttribute::Address(IpAddr::V4(address)) = attr
                    && *address == addr
                {
                    let index = msg.header.index;
                    let name =
                        self.link_name(index).await.unwrap_or_default();
                    let network =
                        Ipv4Network::new(addr, msg.header.prefix_len).ok();
                    return Ok(Some(LinkInfo::new(index, name, network)));
                }
            }
        }
        Ok(None)
    }

    async fn rule_list(&self) -> Result<Vec<IpRule>, Error> {
        let mut rules = Vec::new();
        let mut dump = self.handle.rule().get(IpVersion::V4).execute();
        while let Some(msg) = dump.try_next().await.map_err(netlink_error)? {
            if let Some(rule) = parse_rule_msg(&msg)
                && rule.priority == EGRESS_RULE_PRIORITY
            {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    async fn rule_add(&self, rule: &IpRule) -> Result<(), Error> {
        self.rule_request(rule)
            .execute()
            .await
            .map_err(netlink_error)
    }

    async fn rule_del(&self, rule: &IpRule) -> Result<(), Error> {
        let mut request = self.rule_request(rule);
        let request = self.handle.rule().del(request.message_mut().clone());
        request.execute().await.map_err(netlink_error)
    }

    async fn route_list(&self) -> Result<Vec<IpRoute>, Error> {
        let mut routes = Vec::new();
        let mut dump = self.handle.route().get(IpVersion::V4).execute();
        while let Some(msg) = dump.try_next().await.map_err(netlink_error)? {
            if let Some(route) = parse_route_msg(&msg) {
                routes.push(route);
            }
        }
        Ok(routes)
    }

    async fn route_add(&self, route: &IpRoute) -> Result<(), Error> {
        self.route_request(route)
            .replace()
            .execute()
            .await
            .map_err(netlink_error)
    }

    async fn route_del(&self, route: &IpRoute) -> Result<(), Error> {
        let mut request = self.route_request(route);
        let request = self.handle.route().del(request.message_mut().clone());
        request.execute().await.map_err(netlink_error)
    }
}

// ===== helper functions =====

fn netlink_error(error: rtnetlink::Error) -> Error {
    Error::Netlink(std::io::Error::other(error))
}

fn parse_rule_msg(msg: &RuleMessage) -> Option<IpRule> {
    let mut priority = 0;
    let mut table = msg.header.table as u32;
    let mut source = None;
    let mut dest = None;

    for attr in &msg.attributes {
        match attr {
            RuleAttribute::Priority(value) => priority = *value,
            RuleAttribute::Table(value) => table = *value,
            RuleAttribute::Source(IpAddr::V4(addr)) => {
                source = Ipv4Network::new(*addr, msg.header.src_len).ok();
            }
            RuleAttribute::Destination(IpAddr::V4(addr)) => {
                dest = Ipv4Network::new(*addr, msg.header.dst_len).ok();
            }
            _ => (),
        }
    }

    Some(IpRule::new(priority, source?, dest?, table))
}

fn parse_route_msg(msg: &RouteMessage) -> Option<IpRoute> {
    let mut table = msg.header.table as u32;
    let mut iface_index = 0;
    let mut gateway = None;
    let mut dest = None;

    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Table(value) => table = *value,
            RouteAttribute::Oif(value) => iface_index = *value,
            RouteAttribute::Gateway(RouteAddress::Inet(addr)) => {
                gateway = Some(*addr);
            }
            RouteAttribute::Destination(RouteAddress::Inet(addr)) => {
                dest = Ipv4Network::new(
                    *addr,
                    msg.header.destination_prefix_length,
                )
                .ok();
            }
            _ => (),
        }
    }

    // Default routes carry no destination attribute.
    let dest = dest.or_else(|| {
        (msg.header.destination_prefix_length == 0)
            .then(|| Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).unwrap())
    })?;

    Some(IpRoute::new(table, dest, gateway, iface_index))
}

// ===== global functions =====

/// Returns the index of the routing table owned by the egress gateway
/// subsystem for the given interface. The mapping is one-to-one and stable.
pub fn egress_gateway_routing_table_idx(iface_index: u32) -> u32 {
    ROUTE_TABLE_EGRESS_OFFSET + iface_index
}

/// Creates the netlink socket used to program the host routing table.
pub fn init() -> NetlinkRouteTable {
    // Create netlink connection.
    let (conn, handle, _) = new_connection().unwrap();

    // Spawn the netlink connection on a separate thread with permanent
    // elevated capabilities.
    std::thread::spawn(|| {
        // Raise capabilities.
        let mut caps = CapState::get_current().unwrap();
        caps.effective = caps.permitted;
        if let Err(error) = caps.set_current() {
            error!("failed to update current capabilities: {}", error);
        }

        // Serve requests initiated by the netlink handle.
        futures::executor::block_on(conn)
    });

    NetlinkRouteTable { handle }
}
