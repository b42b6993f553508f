// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::assembly::AssemblyManager;
use crate::bootstrap::Services;
use crate::config::{ReplicationConfig, RuntimeConfig};
use crate::error::ClusterError;
use crate::monitor::RecordOp;
use crate::pool::{WorkerConnection, WorkerRef};
use crate::protocol::{NodeDeploymentInfo, NodePerformanceCounters};
use crate::replication::Replica;
use crate::scheduler::SchedulerFactory;
use crate::storage::ProcessArtifactStore;
use crate::tasklog::TaskLogOp;
use chrono::{DateTime, Utc};
use mbrace_common::model::{DeploymentId, NodeId, NodeInfo, NodeType, Permissions};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use sysinfo::System;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tracing::{error, info, warn};

const EVENT_LOG_CAPACITY: usize = 512;

/// Latched cluster-wide failure flag, raised by the process manager's fault
/// handler. Whether the cluster recovers or is torn down is the cluster
/// manager's decision; the signal only records and publishes the condition.
#[derive(Clone, Default)]
pub struct FailureSignal {
    inner: Arc<FailureSignalState>,
}

#[derive(Default)]
struct FailureSignalState {
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl FailureSignal {
    pub fn new() -> FailureSignal {
        FailureSignal::default()
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let mut current = self.inner.reason.lock().unwrap();
        if current.is_none() {
            let reason = reason.into();
            error!(%reason, "cluster failure signalled");
            *current = Some(reason);
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_failed(&self) -> bool {
        self.inner.reason.lock().unwrap().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().unwrap().clone()
    }

    pub async fn failed(&self) -> String {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}

/// A cluster node with its live capability handles. Only the descriptor
/// travels on the wire; connections and replica handles are established by
/// the node communication layer.
#[derive(Clone)]
pub struct NodeRef {
    pub info: NodeInfo,
    pub worker: Option<Arc<dyn WorkerConnection>>,
    pub task_log_replica: Option<Arc<dyn Replica<TaskLogOp>>>,
    pub record_replica: Option<Arc<dyn Replica<RecordOp>>>,
}

/// Master-boot configuration: the initial node set plus the replication
/// policy for the task log and the record table.
#[derive(Clone)]
pub struct ClusterConfiguration {
    pub nodes: Vec<NodeRef>,
    pub replication_factor: usize,
    pub failover_factor: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub at: DateTime<Utc>,
    pub kind: ClusterEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterEventKind {
    MasterBooted { deployment_id: DeploymentId },
    NodeAttached { node_id: NodeId },
    NodeDetached { node_id: NodeId },
    PermissionsChanged { node_id: NodeId, permissions: Permissions },
    WorkerFailed { node_id: NodeId },
    ClusterFailed { reason: String },
    ShutDown,
}

struct ClusterState {
    nodes: HashMap<NodeId, NodeRef>,
    master: Option<NodeId>,
    booted_at: Option<DateTime<Utc>>,
    events: VecDeque<ClusterEvent>,
}

/// Node administration surface: membership, permissions, deployment
/// introspection and master boot. Consumed by the CLI/admin tooling.
pub struct ClusterManager {
    deployment_id: DeploymentId,
    config: RuntimeConfig,
    scheduler_factory: Arc<dyn SchedulerFactory>,
    assemblies: Arc<dyn AssemblyManager>,
    artifacts: Arc<dyn ProcessArtifactStore>,
    state: Mutex<ClusterState>,
    services: Mutex<Option<Services>>,
}

impl ClusterManager {
    pub fn new(
        config: RuntimeConfig,
        scheduler_factory: Arc<dyn SchedulerFactory>,
        assemblies: Arc<dyn AssemblyManager>,
        artifacts: Arc<dyn ProcessArtifactStore>,
    ) -> ClusterManager {
        ClusterManager {
            deployment_id: DeploymentId::new_v4(),
            config,
            scheduler_factory,
            assemblies,
            artifacts,
            state: Mutex::new(ClusterState {
                nodes: HashMap::new(),
                master: None,
                booted_at: None,
                events: VecDeque::new(),
            }),
            services: Mutex::new(None),
        }
    }

    pub fn ping(&self) -> DeploymentId {
        self.deployment_id
    }

    pub fn deployment_id(&self) -> DeploymentId {
        self.deployment_id
    }

    pub fn services(&self) -> Option<Services> {
        self.services.lock().unwrap().clone()
    }

    pub fn deployment_info(&self) -> NodeDeploymentInfo {
        let failure = self
            .services()
            .and_then(|services| services.fault_signal.reason());
        let state = self.state.lock().unwrap();
        NodeDeploymentInfo {
            deployment_id: self.deployment_id,
            master: state
                .master
                .and_then(|id| state.nodes.get(&id).map(|node| node.info.clone())),
            nodes: state.nodes.values().map(|node| node.info.clone()).collect(),
            booted_at: state.booted_at,
            failure,
        }
    }

    pub fn performance_counters(&self) -> NodePerformanceCounters {
        let mut system = System::new_all();
        system.refresh_all();
        NodePerformanceCounters {
            cpu_usage: system.global_cpu_usage(),
            total_memory_bytes: system.total_memory(),
            used_memory_bytes: system.used_memory(),
            process_count: system.processes().len(),
        }
    }

    pub fn attach(&self, node: NodeRef) {
        let node_id = node.info.node_id;
        {
            let mut state = self.state.lock().unwrap();
            state.nodes.insert(node_id, node.clone());
        }
        if let (Some(connection), true) = (
            node.worker.clone(),
            node.info.permissions.can_execute_tasks(),
        ) {
            if let Some(services) = self.services() {
                services.pool.attach(WorkerRef {
                    worker_id: node_id,
                    address: node.info.address.clone(),
                    permissions: node.info.permissions,
                    connection,
                });
            }
        }
        info!(node_id = %node_id, node_type = %node.info.node_type, "node attached");
        self.record_event(ClusterEventKind::NodeAttached { node_id });
    }

    pub fn detach(&self, node_id: &NodeId) -> Option<NodeInfo> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.nodes.remove(node_id).map(|node| node.info)
        };
        if removed.is_some() {
            if let Some(services) = self.services() {
                services.pool.detach(node_id);
            }
            self.record_event(ClusterEventKind::NodeDetached { node_id: *node_id });
        }
        removed
    }

    pub fn set_node_permissions(&self, node_id: &NodeId, permissions: Permissions) -> bool {
        let node = {
            let mut state = self.state.lock().unwrap();
            match state.nodes.get_mut(node_id) {
                Some(node) => {
                    node.info.permissions = permissions;
                    Some(node.clone())
                }
                None => None,
            }
        };
        let Some(node) = node else {
            return false;
        };

        if let Some(services) = self.services() {
            if permissions.can_execute_tasks() {
                if let Some(connection) = node.worker.clone() {
                    if !services.pool.set_permissions(node_id, permissions) {
                        services.pool.attach(WorkerRef {
                            worker_id: *node_id,
                            address: node.info.address.clone(),
                            permissions,
                            connection,
                        });
                    }
                }
            } else {
                services.pool.detach(node_id);
            }
        }
        self.record_event(ClusterEventKind::PermissionsChanged {
            node_id: *node_id,
            permissions,
        });
        true
    }

    pub fn get_all_nodes(&self) -> Vec<NodeInfo> {
        let state = self.state.lock().unwrap();
        state.nodes.values().map(|node| node.info.clone()).collect()
    }

    pub fn get_master_and_alts(&self) -> (Option<NodeInfo>, Vec<NodeInfo>) {
        let state = self.state.lock().unwrap();
        let master = state
            .master
            .and_then(|id| state.nodes.get(&id).map(|node| node.info.clone()));
        let alts = state
            .nodes
            .values()
            .filter(|node| node.info.node_type == NodeType::Alt)
            .map(|node| node.info.clone())
            .collect();
        (master, alts)
    }

    pub fn log_dump(&self) -> Vec<ClusterEvent> {
        let state = self.state.lock().unwrap();
        state.events.iter().cloned().collect()
    }

    /// Membership signal: an executor node died. Removes the node and lets
    /// the worker pool broadcast the failure to every task manager.
    pub fn node_failed(&self, node_id: &NodeId) {
        {
            let mut state = self.state.lock().unwrap();
            state.nodes.remove(node_id);
        }
        if let Some(services) = self.services() {
            services.pool.on_worker_failure(node_id);
        }
    }

    /// Boots this node as the active master: wires the worker pool, the
    /// replicated record table and the process manager from the given
    /// configuration.
    pub fn master_boot(
        self: &Arc<Self>,
        configuration: ClusterConfiguration,
    ) -> Result<Services, ClusterError> {
        {
            let services = self.services.lock().unwrap();
            if services.is_some() {
                return Err(ClusterError::AlreadyBooted);
            }
        }

        let replication = ReplicationConfig {
            replication_factor: configuration.replication_factor,
            failover_factor: configuration.failover_factor,
            broadcast_timeout: self.config.replication.broadcast_timeout,
        };

        let task_log_replicas: Vec<Arc<dyn Replica<TaskLogOp>>> = configuration
            .nodes
            .iter()
            .filter_map(|node| node.task_log_replica.clone())
            .collect();
        let record_replicas: Vec<Arc<dyn Replica<RecordOp>>> = configuration
            .nodes
            .iter()
            .filter_map(|node| node.record_replica.clone())
            .collect();
        if task_log_replicas.len() < replication.replication_factor {
            warn!(
                replicas = task_log_replicas.len(),
                replication_factor = replication.replication_factor,
                "fewer replicas than the replication factor, synchronous writes cannot reach quorum"
            );
        }

        let services = Services::new(
            &self.config,
            &replication,
            task_log_replicas,
            record_replicas,
            self.scheduler_factory.clone(),
            self.assemblies.clone(),
            self.artifacts.clone(),
        );

        {
            let mut state = self.state.lock().unwrap();
            state.booted_at = Some(Utc::now());
            state.master = configuration
                .nodes
                .iter()
                .find(|node| node.info.node_type == NodeType::Master)
                .map(|node| node.info.node_id);
            for node in &configuration.nodes {
                state.nodes.insert(node.info.node_id, node.clone());
            }
        }
        for node in &configuration.nodes {
            if let (Some(connection), true) = (
                node.worker.clone(),
                node.info.permissions.can_execute_tasks(),
            ) {
                services.pool.attach(WorkerRef {
                    worker_id: node.info.node_id,
                    address: node.info.address.clone(),
                    permissions: node.info.permissions,
                    connection,
                });
            }
        }

        *self.services.lock().unwrap() = Some(services.clone());
        self.record_event(ClusterEventKind::MasterBooted {
            deployment_id: self.deployment_id,
        });
        info!(deployment_id = %self.deployment_id, "master booted");

        self.spawn_watcher(&services);
        Ok(services)
    }

    /// Fire-and-forget shutdown; `shutdown_sync` reports completion.
    pub fn shutdown(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.shutdown_sync().await;
        });
    }

    pub async fn shutdown_sync(&self) {
        let services = {
            let mut slot = self.services.lock().unwrap();
            slot.take()
        };
        if let Some(services) = services {
            match services.process_manager.get_all_process_info().await {
                Ok(infos) => {
                    for info in infos {
                        if !info.state.is_terminal() {
                            let _ = services.process_manager.kill_process(info.process_id).await;
                        }
                    }
                }
                Err(err) => warn!(%err, "failed to enumerate processes during shutdown"),
            }
            for worker_id in services.pool.worker_ids() {
                services.pool.detach(&worker_id);
            }
        }
        {
            let mut state = self.state.lock().unwrap();
            state.nodes.clear();
            state.master = None;
        }
        self.record_event(ClusterEventKind::ShutDown);
        info!(deployment_id = %self.deployment_id, "cluster shut down");
    }

    fn spawn_watcher(self: &Arc<Self>, services: &Services) {
        let manager = self.clone();
        let mut failures = services.pool.subscribe_failures();
        let signal = services.fault_signal.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    failure = failures.recv() => match failure {
                        Ok(node_id) => {
                            manager.record_event(ClusterEventKind::WorkerFailed { node_id });
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                    reason = signal.failed() => {
                        manager.record_event(ClusterEventKind::ClusterFailed { reason });
                        break;
                    }
                }
            }
        });
    }

    fn record_event(&self, kind: ClusterEventKind) {
        let mut state = self.state.lock().unwrap();
        if state.events.len() == EVENT_LOG_CAPACITY {
            state.events.pop_front();
        }
        state.events.push_back(ClusterEvent {
            at: Utc::now(),
            kind,
        });
    }
}
