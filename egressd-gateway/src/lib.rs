//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod endpoint;
pub mod error;
pub mod identity;
pub mod netlink;
pub mod node;
pub mod policy;
pub mod policy_map;
mod reconcile;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use bitflags::bitflags;
use derive_new::new;
use egressd_utils::task::Task;
use egressd_utils::trigger::{Trigger, TriggerRunner};
use egressd_utils::workqueue::WorkQueue;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, warn};

use crate::endpoint::{Endpoint, EndpointEvent, EndpointMetadata};
use crate::error::Error;
use crate::identity::IdentityResolver;
use crate::netlink::RouteTable;
use crate::node::Node;
use crate::policy::PolicyConfig;
use crate::policy_map::PolicyMap;

// Backoff applied to endpoint events whose identity cannot be resolved yet.
const ENDPOINT_RETRY_BASE_DELAY: Duration = Duration::from_millis(20);
const ENDPOINT_RETRY_MAX_DELAY: Duration = Duration::from_secs(20 * 60);

/// A namespace-qualified object name, identifying policies and endpoints.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, new)]
#[derive(Deserialize, Serialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

pub type PolicyId = NamespacedName;
pub type EndpointId = NamespacedName;

bitflags! {
    // Classes of cache events observed since the last reconciliation,
    // deciding which derived indices need a rebuild.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Events: u8 {
        const UPDATE_ENDPOINT = 0x01;
        const DELETE_ENDPOINT = 0x02;
        const ADD_POLICY = 0x04;
        const DELETE_POLICY = 0x08;
        const UPDATE_NODE = 0x10;
        const DELETE_NODE = 0x20;
        const SYNC_DONE = 0x40;
    }
}

/// Manager configuration.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    // Name of the node this manager runs on.
    pub local_node_name: String,
    // Whether to install IP rules and routes for locally gatewayed
    // policies.
    pub install_egress_gateway_routes: bool,
    // Minimum interval between reconciliation runs.
    pub reconciliation_trigger_interval: Duration,
    // Bound on identity resolution calls.
    pub connectivity_timeout: Duration,
}

/// Egress gateway manager: owns the policy, endpoint, and node caches and
/// reconciles the datapath policy map and the host routing table against
/// them.
#[derive(Debug)]
pub struct Manager<I, P, R> {
    // Caches and datapath handles, under the manager lock.
    state: Mutex<ManagerState<P, R>>,
    // Latest-wins buffer of endpoint events, keyed by endpoint id. Never
    // locked while waiting for the manager lock.
    pending_endpoint_events: RwLock<HashMap<EndpointId, EndpointEvent>>,
    // Queue feeding the endpoint event worker.
    endpoint_event_queue: WorkQueue<EndpointId>,
    // Reconciliation trigger.
    reconciliation_trigger: Trigger,
    trigger_runner: StdMutex<Option<TriggerRunner>>,
    trigger_task: StdMutex<Option<Task<()>>>,
    endpoint_worker: StdMutex<Option<Task<()>>>,
    identity_resolver: I,
    connectivity_timeout: Duration,
    // Endpoints dropped because their metadata could not be built.
    metadata_errors: AtomicU64,
}

#[derive(Debug)]
pub(crate) struct ManagerState<P, R> {
    pub(crate) policy_configs: HashMap<PolicyId, PolicyConfig>,
    pub(crate) policy_configs_by_source_ip: HashMap<String, Vec<PolicyId>>,
    pub(crate) ep_data_store: HashMap<EndpointId, EndpointMetadata>,
    pub(crate) node_data_store: HashMap<String, Node>,
    // Nodes sorted by name, for deterministic gateway selection.
    pub(crate) nodes: Vec<Node>,
    pub(crate) events: Events,
    pub(crate) synced: bool,
    pub(crate) install_routes: bool,
    pub(crate) local_node: String,
    pub(crate) policy_map: P,
    pub(crate) route_table: R,
}

// ===== impl ManagerConfig =====

impl ManagerConfig {
    pub const DFLT_TRIGGER_INTERVAL: Duration = Duration::from_secs(1);
    pub const DFLT_CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(local_node_name: impl Into<String>) -> ManagerConfig {
        ManagerConfig {
            local_node_name: local_node_name.into(),
            install_egress_gateway_routes: false,
            reconciliation_trigger_interval: Self::DFLT_TRIGGER_INTERVAL,
            connectivity_timeout: Self::DFLT_CONNECTIVITY_TIMEOUT,
        }
    }
}

// ===== impl ManagerState =====

impl<P, R> ManagerState<P, R> {
    // Rebuilds the sorted node slice from the node store.
    fn rebuild_nodes(&mut self) {
        let mut nodes =
            self.node_data_store.values().cloned().collect::<Vec<_>>();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        self.nodes = nodes;
    }
}

// ===== impl Manager =====

impl<I, P, R> Manager<I, P, R>
where
    I: IdentityResolver,
    P: PolicyMap,
    R: RouteTable,
{
    pub fn new(
        config: ManagerConfig,
        identity_resolver: I,
        policy_map: P,
        route_table: R,
    ) -> Arc<Manager<I, P, R>> {
        let (trigger, runner) =
            Trigger::new(config.reconciliation_trigger_interval);

        Arc::new(Manager {
            state: Mutex::new(ManagerState {
                policy_configs: HashMap::new(),
                policy_configs_by_source_ip: HashMap::new(),
                ep_data_store: HashMap::new(),
                node_data_store: HashMap::new(),
                nodes: Vec::new(),
                events: Events::empty(),
                synced: false,
                install_routes: config.install_egress_gateway_routes,
                local_node: config.local_node_name,
                policy_map,
                route_table,
            }),
            pending_endpoint_events: RwLock::new(HashMap::new()),
            endpoint_event_queue: WorkQueue::new(
                ENDPOINT_RETRY_BASE_DELAY,
                ENDPOINT_RETRY_MAX_DELAY,
            ),
            reconciliation_trigger: trigger,
            trigger_runner: StdMutex::new(Some(runner)),
            trigger_task: StdMutex::new(None),
            endpoint_worker: StdMutex::new(None),
            identity_resolver,
            connectivity_timeout: config.connectivity_timeout,
            metadata_errors: AtomicU64::new(0),
        })
    }

    /// Starts the reconciliation trigger and the endpoint event worker.
    pub fn start(self: &Arc<Self>) {
        let Some(runner) = self.trigger_runner.lock().unwrap().take() else {
            // Already started.
            return;
        };

        let manager = self.clone();
        let task = runner.run(move |reasons| {
            let manager = manager.clone();
            async move {
                manager.reconcile(&reasons).await;
            }
        });
        *self.trigger_task.lock().unwrap() = Some(task);

        let manager = self.clone();
        let task = Task::spawn(async move {
            manager.process_endpoint_events().await;
        });
        *self.endpoint_worker.lock().unwrap() = Some(task);
    }

    /// Stops the manager, waiting for the endpoint event worker to drain.
    pub async fn stop(&self) {
        // Dropping the trigger task aborts the runner.
        self.trigger_task.lock().unwrap().take();

        self.endpoint_event_queue.shut_down();
        let worker = self.endpoint_worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    // ===== event handlers =====

    pub async fn on_add_egress_policy(&self, policy: PolicyConfig) {
        let mut state = self.state.lock().await;
        if state.policy_configs.contains_key(&policy.id) {
            debug!(policy = %policy.id, "updated egress policy");
        } else {
            debug!(policy = %policy.id, "added egress policy");
        }
        state.policy_configs.insert(policy.id.clone(), policy);
        state.events.insert(Events::ADD_POLICY);
        self.reconciliation_trigger
            .trigger_with_reason("egress policy added");
    }

    pub async fn on_delete_egress_policy(&self, policy_id: &PolicyId) {
        let mut state = self.state.lock().await;
        if state.policy_configs.remove(policy_id).is_none() {
            warn!(policy = %policy_id,
                "attempted to delete unknown egress policy");
            return;
        }
        debug!(policy = %policy_id, "deleted egress policy");
        state.events.insert(Events::DELETE_POLICY);
        self.reconciliation_trigger
            .trigger_with_reason("egress policy deleted");
    }

    /// Buffers an endpoint update for the endpoint event worker. Unlike the
    /// other handlers, never takes the manager lock.
    pub fn on_update_endpoint(&self, endpoint: Endpoint) {
        let endpoint_id = endpoint.id.clone();
        self.pending_endpoint_events
            .write()
            .unwrap()
            .insert(endpoint_id.clone(), EndpointEvent::Update(endpoint));
        self.endpoint_event_queue.add(endpoint_id);
    }

    /// Buffers an endpoint deletion for the endpoint event worker.
    pub fn on_delete_endpoint(&self, endpoint: Endpoint) {
        let endpoint_id = endpoint.id.clone();
        self.pending_endpoint_events
            .write()
            .unwrap()
            .insert(endpoint_id.clone(), EndpointEvent::Delete(endpoint));
        self.endpoint_event_queue.add(endpoint_id);
    }

    pub async fn on_update_node(&self, node: Node) {
        let mut state = self.state.lock().await;
        debug!(node = %node.name, "node updated");
        state.node_data_store.insert(node.name.clone(), node);
        state.rebuild_nodes();
        state.events.insert(Events::UPDATE_NODE);
        self.reconciliation_trigger.trigger_with_reason("node updated");
    }

    pub async fn on_delete_node(&self, node: &Node) {
        let mut state = self.state.lock().await;
        if state.node_data_store.remove(&node.name).is_none() {
            return;
        }
        debug!(node = %node.name, "node deleted");
        state.rebuild_nodes();
        state.events.insert(Events::DELETE_NODE);
        self.reconciliation_trigger.trigger_with_reason("node deleted");
    }

    /// Signals that the cluster watcher has delivered its initial snapshot
    /// of every resource kind. Reconciliation is skipped until then.
    pub async fn on_sync_done(&self) {
        let mut state = self.state.lock().await;
        state.synced = true;
        state.events.insert(Events::SYNC_DONE);
        self.reconciliation_trigger.trigger_with_reason("sync done");
    }

    // ===== reconciliation =====

    /// Runs one reconciliation pass. Normally invoked by the trigger.
    pub async fn reconcile(&self, reason: &str) {
        let mut state = self.state.lock().await;
        debug!(%reason, "reconciling egress gateway state");
        reconcile::reconcile_locked(&mut state).await;
    }

    // ===== endpoint event worker =====

    // Consumes the endpoint event queue. An event left in the pending
    // buffer after processing means the attempt failed; it is then
    // re-queued with backoff.
    async fn process_endpoint_events(&self) {
        while let Some(endpoint_id) = self.endpoint_event_queue.get().await {
            let event = self
                .pending_endpoint_events
                .read()
                .unwrap()
                .get(&endpoint_id)
                .cloned();
            match event {
                Some(EndpointEvent::Update(_)) => {
                    self.add_endpoint(&endpoint_id).await;
                }
                Some(EndpointEvent::Delete(_)) => {
                    self.delete_endpoint(&endpoint_id).await;
                }
                None => (),
            }

            if self
                .pending_endpoint_events
                .read()
                .unwrap()
                .contains_key(&endpoint_id)
            {
                self.endpoint_event_queue
                    .add_rate_limited(endpoint_id.clone());
            } else {
                self.endpoint_event_queue.forget(&endpoint_id);
            }
            self.endpoint_event_queue.done(&endpoint_id);
        }
    }

    async fn add_endpoint(&self, endpoint_id: &EndpointId) {
        let mut state = self.state.lock().await;

        // Re-read the pending event; it may have been overwritten or
        // deleted meanwhile.
        let pending = self
            .pending_endpoint_events
            .read()
            .unwrap()
            .get(endpoint_id)
            .cloned();
        let Some(EndpointEvent::Update(endpoint)) = pending else {
            return;
        };

        // Resolve the endpoint identity into its label set. Failures leave
        // the pending entry in place, so the worker retries with backoff.
        let timeout = self.connectivity_timeout;
        match time::timeout(
            timeout,
            self.identity_resolver.wait_for_initial_identities(),
        )
        .await
        {
            Ok(Ok(())) => (),
            Ok(Err(error)) => {
                error.log();
                return;
            }
            Err(_) => {
                Error::InitialIdentitiesUnavailable.log();
                return;
            }
        }
        let identity = match time::timeout(
            timeout,
            self.identity_resolver.lookup_identity_by_id(endpoint.identity),
        )
        .await
        {
            Ok(Some(identity)) => identity,
            Ok(None) | Err(_) => {
                Error::IdentityNotFound(endpoint.identity).log();
                return;
            }
        };

        self.pending_endpoint_events.write().unwrap().remove(endpoint_id);

        let metadata =
            match endpoint::endpoint_metadata(&endpoint, identity.labels) {
                Ok(metadata) => metadata,
                Err(error) => {
                    // Terminal for this attempt: the pending entry is
                    // already cleared.
                    self.metadata_errors.fetch_add(1, Ordering::Relaxed);
                    error.log();
                    return;
                }
            };

        state.ep_data_store.insert(endpoint_id.clone(), metadata);
        state.events.insert(Events::UPDATE_ENDPOINT);
        self.reconciliation_trigger.trigger_with_reason("endpoint updated");
    }

    async fn delete_endpoint(&self, endpoint_id: &EndpointId) {
        let mut state = self.state.lock().await;
        state.ep_data_store.remove(endpoint_id);
        self.pending_endpoint_events.write().unwrap().remove(endpoint_id);
        state.events.insert(Events::DELETE_ENDPOINT);
        self.reconciliation_trigger.trigger_with_reason("endpoint deleted");
    }

    // ===== introspection =====

    /// Returns the stored metadata of an endpoint, if any.
    pub async fn endpoint_metadata(
        &self,
        endpoint_id: &EndpointId,
    ) -> Option<EndpointMetadata> {
        let state = self.state.lock().await;
        state.ep_data_store.get(endpoint_id).cloned()
    }

    /// Returns the policies matching the given source IP.
    pub async fn policies_by_source_ip(
        &self,
        source_ip: Ipv4Addr,
    ) -> Vec<PolicyId> {
        let state = self.state.lock().await;
        state
            .policy_configs_by_source_ip
            .get(&source_ip.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the known nodes, sorted by name.
    pub async fn nodes(&self) -> Vec<Node> {
        let state = self.state.lock().await;
        state.nodes.clone()
    }

    /// Tells whether an endpoint still has an unprocessed pending event.
    pub fn has_pending_endpoint_event(&self, endpoint_id: &EndpointId) -> bool {
        self.pending_endpoint_events
            .read()
            .unwrap()
            .contains_key(endpoint_id)
    }

    /// Number of endpoints dropped because their metadata could not be
    /// built after identity resolution.
    pub fn metadata_error_count(&self) -> u64 {
        self.metadata_errors.load(Ordering::Relaxed)
    }
}

// ===== impl NamespacedName =====

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
