//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use egressd_gateway::endpoint::Endpoint;
use egressd_gateway::error::Error;
use egressd_gateway::identity::{Identity, IdentityResolver};
use egressd_gateway::netlink::{IpRoute, IpRule, LinkInfo, RouteTable};
use egressd_gateway::node::Node;
use egressd_gateway::policy::{LabelSelector, PolicyConfig};
use egressd_gateway::policy_map::{
    EXCLUDED_CIDR_IPV4, EgressPolicyKey4, EgressPolicyVal4, PolicyMap,
};
use egressd_gateway::{Manager, ManagerConfig, NamespacedName};
use ipnetwork::Ipv4Network;
use maplit::btreemap;

// ===== test doubles =====

#[derive(Clone, Debug, Default)]
struct FakeResolver {
    identities: Arc<Mutex<HashMap<u64, Identity>>>,
}

impl FakeResolver {
    fn insert(&self, identity: Identity) {
        self.identities.lock().unwrap().insert(identity.id, identity);
    }
}

impl IdentityResolver for FakeResolver {
    async fn wait_for_initial_identities(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn lookup_identity_by_id(&self, id: u64) -> Option<Identity> {
        self.identities.lock().unwrap().get(&id).cloned()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MapOp {
    Update(EgressPolicyKey4),
    Delete(EgressPolicyKey4),
}

#[derive(Clone, Debug, Default)]
struct FakePolicyMap {
    entries: Arc<Mutex<HashMap<EgressPolicyKey4, EgressPolicyVal4>>>,
    ops: Arc<Mutex<Vec<MapOp>>>,
}

impl FakePolicyMap {
    fn entries(&self) -> HashMap<EgressPolicyKey4, EgressPolicyVal4> {
        self.entries.lock().unwrap().clone()
    }

    fn ops(&self) -> Vec<MapOp> {
        self.ops.lock().unwrap().clone()
    }

    fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }
}

impl PolicyMap for FakePolicyMap {
    fn update(
        &self,
        source_ip: Ipv4Addr,
        dest_cidr: Ipv4Network,
        egress_ip: Ipv4Addr,
        gateway_ip: Ipv4Addr,
    ) -> Result<(), Error> {
        let key = EgressPolicyKey4::new(source_ip, dest_cidr);
        self.entries
            .lock()
            .unwrap()
            .insert(key, EgressPolicyVal4::new(egress_ip, gateway_ip));
        self.ops.lock().unwrap().push(MapOp::Update(key));
        Ok(())
    }

    fn delete(
        &self,
        source_ip: Ipv4Addr,
        dest_cidr: Ipv4Network,
    ) -> Result<(), Error> {
        let key = EgressPolicyKey4::new(source_ip, dest_cidr);
        self.entries.lock().unwrap().remove(&key);
        self.ops.lock().unwrap().push(MapOp::Delete(key));
        Ok(())
    }

    fn iterate_with_callback(
        &self,
        cb: &mut dyn FnMut(&EgressPolicyKey4, &EgressPolicyVal4),
    ) {
        for (key, val) in self.entries.lock().unwrap().iter() {
            cb(key, val);
        }
    }
}

#[derive(Debug, Default)]
struct FakeNet {
    links: Vec<LinkInfo>,
    rules: Vec<IpRule>,
    routes: Vec<IpRoute>,
    // Rule and route operations issued, lists included.
    rule_route_ops: usize,
}

#[derive(Clone, Debug, Default)]
struct FakeRouteTable {
    net: Arc<Mutex<FakeNet>>,
}

impl FakeRouteTable {
    fn add_link(&self, name: &str, index: u32, address: Ipv4Network) {
        self.net.lock().unwrap().links.push(LinkInfo::new(
            index,
            name.to_owned(),
            Some(address),
        ));
    }

    fn rules(&self) -> Vec<IpRule> {
        self.net.lock().unwrap().rules.clone()
    }

    fn routes(&self) -> Vec<IpRoute> {
        self.net.lock().unwrap().routes.clone()
    }

    fn rule_route_ops(&self) -> usize {
        self.net.lock().unwrap().rule_route_ops
    }
}

impl RouteTable for FakeRouteTable {
    async fn link_by_name(&self, name: &str) -> Result<Option<LinkInfo>, Error> {
        let net = self.net.lock().unwrap();
        Ok(net.links.iter().find(|link| link.name == name).cloned())
    }

    async fn link_by_address(
        &self,
        addr: Ipv4Addr,
    ) -> Result<Option<LinkInfo>, Error> {
        let net = self.net.lock().unwrap();
        Ok(net
            .links
            .iter()
            .find(|link| {
                link.address.is_some_and(|address| address.ip() == addr)
            })
            .cloned())
    }

    async fn rule_list(&self) -> Result<Vec<IpRule>, Error> {
        let mut net = self.net.lock().unwrap();
        net.rule_route_ops += 1;
        Ok(net.rules.clone())
    }

    async fn rule_add(&self, rule: &IpRule) -> Result<(), Error> {
        let mut net = self.net.lock().unwrap();
        net.rule_route_ops += 1;
        if !net.rules.contains(rule) {
            net.rules.push(rule.clone());
        }
        Ok(())
    }

    async fn rule_del(&self, rule: &IpRule) -> Result<(), Error> {
        let mut net = self.net.lock().unwrap();
        net.rule_route_ops += 1;
        net.rules.retain(|existing| existing != rule);
        Ok(())
    }

    async fn route_list(&self) -> Result<Vec<IpRoute>, Error> {
        let mut net = self.net.lock().unwrap();
        net.rule_route_ops += 1;
        Ok(net.routes.clone())
    }

    async fn route_add(&self, route: &IpRoute) -> Result<(), Error> {
        let mut net = self.net.lock().unwrap();
        net.rule_route_ops += 1;
        net.routes.retain(|existing| {
            existing.table != route.table || existing.dest != route.dest
        });
        net.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, route: &IpRoute) -> Result<(), Error> {
        let mut net = self.net.lock().unwrap();
        net.rule_route_ops += 1;
        net.routes.retain(|existing| existing != route);
        Ok(())
    }
}

// ===== test fixtures =====

type TestManager = Manager<FakeResolver, FakePolicyMap, FakeRouteTable>;

struct TestContext {
    manager: Arc<TestManager>,
    map: FakePolicyMap,
    net: FakeRouteTable,
    resolver: FakeResolver,
}

fn setup(install_routes: bool) -> TestContext {
    let resolver = FakeResolver::default();
    let map = FakePolicyMap::default();
    let net = FakeRouteTable::default();
    net.add_link("eth1", 7, "192.0.2.10/24".parse().unwrap());
    net.add_link("eth2", 8, "192.0.2.11/24".parse().unwrap());

    let mut config = ManagerConfig::new("node-1");
    config.install_egress_gateway_routes = install_routes;
    config.reconciliation_trigger_interval = Duration::from_millis(100);
    let manager =
        Manager::new(config, resolver.clone(), map.clone(), net.clone());
    manager.start();

    TestContext {
        manager,
        map,
        net,
        resolver,
    }
}

fn test_labels() -> BTreeMap<String, String> {
    btreemap! {"app".to_owned() => "test".to_owned()}
}

fn gateway_node() -> Node {
    Node::new(
        "node-1".to_owned(),
        "192.0.2.1".parse().unwrap(),
        btreemap! {"role".to_owned() => "gateway".to_owned()},
    )
}

fn test_policy(
    name: &str,
    iface: &str,
    dst_cidrs: &[&str],
    excluded_cidrs: &[&str],
) -> PolicyConfig {
    PolicyConfig {
        id: NamespacedName::new("default".to_owned(), name.to_owned()),
        endpoint_selector: LabelSelector::new(test_labels()),
        node_selector: LabelSelector::new(
            btreemap! {"role".to_owned() => "gateway".to_owned()},
        ),
        egress_iface: Some(iface.to_owned()),
        egress_ip: None,
        dst_cidrs: dst_cidrs.iter().map(|cidr| cidr.parse().unwrap()).collect(),
        excluded_cidrs: excluded_cidrs
            .iter()
            .map(|cidr| cidr.parse().unwrap())
            .collect(),
        matched_endpoints: Vec::new(),
        gateway_config: Default::default(),
    }
}

fn test_endpoint(ip: &str) -> Endpoint {
    Endpoint::new(
        NamespacedName::new("default".to_owned(), "ep-1".to_owned()),
        1001,
        vec![ip.parse().unwrap()],
    )
}

fn key(source_ip: &str, dest_cidr: &str) -> EgressPolicyKey4 {
    EgressPolicyKey4::new(
        source_ip.parse().unwrap(),
        dest_cidr.parse().unwrap(),
    )
}

fn val(egress_ip: &str, gateway_ip: &str) -> EgressPolicyVal4 {
    EgressPolicyVal4::new(
        egress_ip.parse().unwrap(),
        gateway_ip.parse().unwrap(),
    )
}

// Waits for the endpoint worker to consume the pending event of the given
// endpoint.
async fn ingest_endpoint(ctx: &TestContext, endpoint: Endpoint) {
    let endpoint_id = endpoint.id.clone();
    ctx.manager.on_update_endpoint(endpoint);
    for _ in 0..500 {
        if !ctx.manager.has_pending_endpoint_event(&endpoint_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("endpoint event was not processed");
}

// Brings up the single-policy single-endpoint baseline used by most tests.
async fn baseline(ctx: &TestContext) {
    ctx.resolver.insert(Identity::new(1001, test_labels()));
    ctx.manager.on_update_node(gateway_node()).await;
    ctx.manager.on_sync_done().await;
    ctx.manager
        .on_add_egress_policy(test_policy(
            "policy-1",
            "eth1",
            &["1.2.3.0/24"],
            &[],
        ))
        .await;
    ingest_endpoint(ctx, test_endpoint("10.0.0.5")).await;
    ctx.manager.reconcile("test").await;
}

// ===== tests =====

#[tokio::test]
async fn single_policy_single_endpoint() {
    let ctx = setup(false);
    baseline(&ctx).await;

    let expected = HashMap::from([(
        key("10.0.0.5", "1.2.3.0/24"),
        val("192.0.2.10", "192.0.2.1"),
    )]);
    assert_eq!(ctx.map.entries(), expected);

    let policies = ctx
        .manager
        .policies_by_source_ip("10.0.0.5".parse().unwrap())
        .await;
    assert_eq!(
        policies,
        vec![NamespacedName::new("default".to_owned(), "policy-1".to_owned())]
    );
}

#[tokio::test]
async fn excluded_cidr_entries_carry_sentinel_gateway() {
    let ctx = setup(false);
    ctx.resolver.insert(Identity::new(1001, test_labels()));
    ctx.manager.on_update_node(gateway_node()).await;
    ctx.manager.on_sync_done().await;
    ctx.manager
        .on_add_egress_policy(test_policy(
            "policy-1",
            "eth1",
            &["1.2.0.0/16"],
            &["1.2.3.0/24"],
        ))
        .await;
    ingest_endpoint(&ctx, test_endpoint("10.0.0.5")).await;
    ctx.manager.reconcile("test").await;

    let expected = HashMap::from([
        (key("10.0.0.5", "1.2.0.0/16"), val("192.0.2.10", "192.0.2.1")),
        (
            key("10.0.0.5", "1.2.3.0/24"),
            EgressPolicyVal4::new(
                "192.0.2.10".parse().unwrap(),
                EXCLUDED_CIDR_IPV4,
            ),
        ),
    ]);
    assert_eq!(ctx.map.entries(), expected);
}

#[tokio::test]
async fn egress_ip_rotation_never_deletes_the_live_key() {
    let ctx = setup(false);
    baseline(&ctx).await;

    // Rotate the egress IP by moving the policy to the other interface.
    ctx.manager
        .on_add_egress_policy(test_policy(
            "policy-1",
            "eth2",
            &["1.2.3.0/24"],
            &[],
        ))
        .await;
    ctx.manager.reconcile("rotate").await;

    let expected = HashMap::from([(
        key("10.0.0.5", "1.2.3.0/24"),
        val("192.0.2.11", "192.0.2.1"),
    )]);
    assert_eq!(ctx.map.entries(), expected);

    // The key never changed, so it must never have been deleted.
    let rotated_key = key("10.0.0.5", "1.2.3.0/24");
    assert!(
        !ctx.map.ops().contains(&MapOp::Delete(rotated_key)),
        "live key was deleted during rotation"
    );
}

#[tokio::test]
async fn endpoint_ip_change_adds_new_key_before_removing_old() {
    let ctx = setup(false);
    baseline(&ctx).await;

    ingest_endpoint(&ctx, test_endpoint("10.0.0.6")).await;
    ctx.manager.reconcile("endpoint moved").await;

    let expected = HashMap::from([(
        key("10.0.0.6", "1.2.3.0/24"),
        val("192.0.2.10", "192.0.2.1"),
    )]);
    assert_eq!(ctx.map.entries(), expected);

    let ops = ctx.map.ops();
    let update_idx = ops
        .iter()
        .position(|op| *op == MapOp::Update(key("10.0.0.6", "1.2.3.0/24")))
        .expect("new key was never written");
    let delete_idx = ops
        .iter()
        .position(|op| *op == MapOp::Delete(key("10.0.0.5", "1.2.3.0/24")))
        .expect("old key was never removed");
    assert!(
        update_idx < delete_idx,
        "stale key removed before the new one was written"
    );
}

#[tokio::test]
async fn endpoint_deletion_empties_the_map() {
    let ctx = setup(false);
    baseline(&ctx).await;

    let endpoint = test_endpoint("10.0.0.5");
    let endpoint_id = endpoint.id.clone();
    ctx.manager.on_delete_endpoint(endpoint);
    for _ in 0..500 {
        if !ctx.manager.has_pending_endpoint_event(&endpoint_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    ctx.manager.reconcile("test").await;

    assert!(ctx.map.entries().is_empty());
    assert!(
        ctx.manager
            .endpoint_metadata(&endpoint_id)
            .await
            .is_none()
    );
    assert!(
        ctx.manager
            .policies_by_source_ip("10.0.0.5".parse().unwrap())
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn policy_deletion_removes_its_entries() {
    let ctx = setup(false);
    baseline(&ctx).await;
    assert_eq!(ctx.map.entries().len(), 1);

    ctx.manager
        .on_delete_egress_policy(&NamespacedName::new(
            "default".to_owned(),
            "policy-1".to_owned(),
        ))
        .await;
    ctx.manager.reconcile("test").await;

    assert!(ctx.map.entries().is_empty());
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let ctx = setup(false);
    baseline(&ctx).await;

    // Flush any reconciliation still pending on the trigger.
    ctx.manager.reconcile("flush").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    ctx.map.clear_ops();
    ctx.manager.reconcile("again").await;
    assert!(
        ctx.map.ops().is_empty(),
        "second reconcile issued policy map operations"
    );
}

#[tokio::test]
async fn disabled_route_installation_issues_no_netlink_operations() {
    let ctx = setup(false);
    baseline(&ctx).await;

    assert_eq!(ctx.map.entries().len(), 1);
    assert_eq!(ctx.net.rule_route_ops(), 0);
}

#[tokio::test]
async fn route_installation_programs_rules_and_routes() {
    let ctx = setup(true);
    baseline(&ctx).await;

    let table = 307;
    assert_eq!(
        ctx.net.rules(),
        vec![IpRule::new(
            8,
            "10.0.0.5/32".parse().unwrap(),
            "1.2.3.0/24".parse().unwrap(),
            table,
        )]
    );
    let routes = ctx.net.routes();
    assert!(routes.contains(&IpRoute::new(
        table,
        "192.0.2.0/24".parse().unwrap(),
        None,
        7,
    )));
    assert!(routes.contains(&IpRoute::new(
        table,
        "0.0.0.0/0".parse().unwrap(),
        Some("192.0.2.1".parse().unwrap()),
        7,
    )));

    // Deleting the policy tears everything down again.
    ctx.manager
        .on_delete_egress_policy(&NamespacedName::new(
            "default".to_owned(),
            "policy-1".to_owned(),
        ))
        .await;
    ctx.manager.reconcile("test").await;
    assert!(ctx.net.rules().is_empty());
    assert!(ctx.net.routes().is_empty());
}

#[tokio::test]
async fn unresolvable_identity_keeps_endpoint_pending() {
    let ctx = setup(false);
    ctx.manager.on_update_node(gateway_node()).await;
    ctx.manager.on_sync_done().await;

    // The resolver knows nothing about identity 1001 yet.
    let endpoint = test_endpoint("10.0.0.5");
    let endpoint_id = endpoint.id.clone();
    ctx.manager.on_update_endpoint(endpoint);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(ctx.manager.has_pending_endpoint_event(&endpoint_id));
    assert!(ctx.manager.endpoint_metadata(&endpoint_id).await.is_none());

    // Once the identity appears, the next retry succeeds.
    ctx.resolver.insert(Identity::new(1001, test_labels()));
    for _ in 0..500 {
        if ctx.manager.endpoint_metadata(&endpoint_id).await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ctx.manager.endpoint_metadata(&endpoint_id).await.is_some());
    assert!(!ctx.manager.has_pending_endpoint_event(&endpoint_id));
}

#[tokio::test]
async fn endpoint_without_ipv4_is_dropped_and_counted() {
    let ctx = setup(false);
    ctx.resolver.insert(Identity::new(1001, test_labels()));
    ctx.manager.on_sync_done().await;

    let endpoint = Endpoint::new(
        NamespacedName::new("default".to_owned(), "ep-1".to_owned()),
        1001,
        Vec::new(),
    );
    let endpoint_id = endpoint.id.clone();
    ctx.manager.on_update_endpoint(endpoint);
    for _ in 0..500 {
        if ctx.manager.metadata_error_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(ctx.manager.metadata_error_count(), 1);
    // Terminal: the pending entry is cleared, no retry happens.
    assert!(!ctx.manager.has_pending_endpoint_event(&endpoint_id));
    assert!(ctx.manager.endpoint_metadata(&endpoint_id).await.is_none());
}

#[tokio::test]
async fn nodes_stay_sorted_by_name() {
    let ctx = setup(false);
    for name in ["node-c", "node-a", "node-b"] {
        ctx.manager
            .on_update_node(Node::new(
                name.to_owned(),
                "198.51.100.1".parse().unwrap(),
                BTreeMap::new(),
            ))
            .await;
    }

    let names = ctx
        .manager
        .nodes()
        .await
        .into_iter()
        .map(|node| node.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["node-a", "node-b", "node-c"]);

    ctx.manager
        .on_delete_node(&Node::new(
            "node-b".to_owned(),
            "198.51.100.1".parse().unwrap(),
            BTreeMap::new(),
        ))
        .await;
    let names = ctx
        .manager
        .nodes()
        .await
        .into_iter()
        .map(|node| node.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["node-a", "node-c"]);
}

#[tokio::test]
async fn trigger_drives_reconciliation_without_explicit_calls() {
    let ctx = setup(false);
    ctx.resolver.insert(Identity::new(1001, test_labels()));
    ctx.manager.on_update_node(gateway_node()).await;
    ctx.manager.on_sync_done().await;
    ctx.manager
        .on_add_egress_policy(test_policy(
            "policy-1",
            "eth1",
            &["1.2.3.0/24"],
            &[],
        ))
        .await;
    ctx.manager.on_update_endpoint(test_endpoint("10.0.0.5"));

    for _ in 0..500 {
        if ctx.map.entries().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        ctx.map.entries(),
        HashMap::from([(
            key("10.0.0.5", "1.2.3.0/24"),
            val("192.0.2.10", "192.0.2.1"),
        )])
    );
}

#[tokio::test]
async fn reconciliation_waits_for_sync() {
    let ctx = setup(false);
    ctx.resolver.insert(Identity::new(1001, test_labels()));
    ctx.manager.on_update_node(gateway_node()).await;
    ctx.manager
        .on_add_egress_policy(test_policy(
            "policy-1",
            "eth1",
            &["1.2.3.0/24"],
            &[],
        ))
        .await;
    ingest_endpoint(&ctx, test_endpoint("10.0.0.5")).await;

    ctx.manager.reconcile("test").await;
    assert!(ctx.map.entries().is_empty());

    ctx.manager.on_sync_done().await;
    ctx.manager.reconcile("test").await;
    assert_eq!(ctx.map.entries().len(), 1);
}

#[tokio::test]
async fn stop_joins_the_endpoint_worker() {
    let ctx = setup(false);
    ctx.resolver.insert(Identity::new(1001, test_labels()));
    ingest_endpoint(&ctx, test_endpoint("10.0.0.5")).await;

    ctx.manager.stop().await;

    // Events buffered after shutdown are never consumed.
    ctx.manager.on_update_endpoint(test_endpoint("10.0.0.6"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ctx.manager.has_pending_endpoint_event(&NamespacedName::new(
        "default".to_owned(),
        "ep-1".to_owned(),
    )));
}
