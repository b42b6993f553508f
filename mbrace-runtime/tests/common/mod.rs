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

use async_trait::async_trait;
use mbrace_common::config::RetryConfig;
use mbrace_common::model::{
    ClientRequestId, NodeId, NodeInfo, NodeType, Permissions, ProcessId, ProcessImage,
    ProcessInfo, TaskId, TaskPayload, WorkerId,
};
use mbrace_common::serialization::{deserialize, serialize};
use mbrace_common::tracing::TracingConfig;
use mbrace_runtime::assembly::InMemoryAssemblyManager;
use mbrace_runtime::bootstrap::Services;
use mbrace_runtime::cluster::{ClusterConfiguration, ClusterManager, NodeRef};
use mbrace_runtime::config::{ReplicationConfig, RuntimeConfig};
use mbrace_runtime::error::{ActivationError, ProcessManagerError, WorkerError};
use mbrace_runtime::monitor::{CompletionSink, InMemoryRecordReplica, ProcessMonitor, RecordOp};
use mbrace_runtime::pool::{WorkerConnection, WorkerPool, WorkerRef};
use mbrace_runtime::process_manager::ProcessManagerHandle;
use mbrace_runtime::replication::{Replica, Replicator};
use mbrace_runtime::scheduler::{SchedulerFactory, SchedulerHandle, SchedulerMessage};
use mbrace_runtime::storage::InMemoryArtifactStore;
use mbrace_runtime::task_manager::{TaskManager, TaskManagerHandle};
use mbrace_runtime::tasklog::{InMemoryTaskLogReplica, TaskLog, TaskLogOp};
use mbrace_common::model::ProcessResult;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Toy computation language the test workers and schedulers interpret; the
/// runtime only ever sees its serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TestComputation {
    Leaf { value: i64 },
    Fanout { values: Vec<i64> },
    Fork,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Value(i64),
    Spawn(Vec<TestComputation>),
}

/// Routes worker-produced results back to the task manager owning the
/// process, standing in for the node communication layer.
#[derive(Clone, Default)]
pub struct ManagerRegistry {
    inner: Arc<Mutex<HashMap<ProcessId, TaskManagerHandle>>>,
}

impl ManagerRegistry {
    pub fn register(&self, handle: TaskManagerHandle) {
        self.inner
            .lock()
            .unwrap()
            .insert(handle.process_id(), handle);
    }

    pub fn get(&self, process_id: &ProcessId) -> Option<TaskManagerHandle> {
        self.inner.lock().unwrap().get(process_id).cloned()
    }
}

/// In-process executor node. Executes received payloads on a spawned task
/// after a configurable delay and honors cancellation: a cancelled task id
/// produces no result and no side effect.
pub struct TestWorker {
    pub worker_id: WorkerId,
    registry: ManagerRegistry,
    leaf_delay: Duration,
    fork_delay: Duration,
    blackhole: AtomicBool,
    reject: AtomicBool,
    fork_counter: Option<Arc<AtomicI64>>,
    received: Mutex<Vec<TaskPayload>>,
    rejected: AtomicUsize,
    cancelled: Arc<Mutex<HashSet<TaskId>>>,
}

impl TestWorker {
    pub fn new(registry: &ManagerRegistry) -> Arc<TestWorker> {
        Self::with_delays(registry, Duration::from_millis(10), Duration::from_millis(10))
    }

    pub fn with_leaf_delay(registry: &ManagerRegistry, leaf_delay: Duration) -> Arc<TestWorker> {
        Self::with_delays(registry, leaf_delay, Duration::from_millis(10))
    }

    pub fn with_delays(
        registry: &ManagerRegistry,
        leaf_delay: Duration,
        fork_delay: Duration,
    ) -> Arc<TestWorker> {
        Arc::new(TestWorker {
            worker_id: WorkerId::new_v4(),
            registry: registry.clone(),
            leaf_delay,
            fork_delay,
            blackhole: AtomicBool::new(false),
            reject: AtomicBool::new(false),
            fork_counter: None,
            received: Mutex::new(Vec::new()),
            rejected: AtomicUsize::new(0),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn with_fork_counter(
        registry: &ManagerRegistry,
        fork_delay: Duration,
        counter: Arc<AtomicI64>,
    ) -> Arc<TestWorker> {
        Arc::new(TestWorker {
            worker_id: WorkerId::new_v4(),
            registry: registry.clone(),
            leaf_delay: Duration::from_millis(10),
            fork_delay,
            blackhole: AtomicBool::new(false),
            reject: AtomicBool::new(false),
            fork_counter: Some(counter),
            received: Mutex::new(Vec::new()),
            rejected: AtomicUsize::new(0),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Accept tasks without ever executing them (a wedged worker).
    pub fn set_blackhole(&self, on: bool) {
        self.blackhole.store(on, Ordering::SeqCst);
    }

    /// Refuse task posts with a communication error.
    pub fn set_reject(&self, on: bool) {
        self.reject.store(on, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<TaskPayload> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn cancelled_ids(&self) -> HashSet<TaskId> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn worker_ref(self: &Arc<Self>) -> WorkerRef {
        WorkerRef {
            worker_id: self.worker_id,
            address: format!("worker-{}", self.worker_id),
            permissions: Permissions::SLAVE,
            connection: self.clone() as Arc<dyn WorkerConnection>,
        }
    }

    pub fn node_ref(self: &Arc<Self>) -> NodeRef {
        NodeRef {
            info: NodeInfo {
                node_id: self.worker_id,
                address: format!("worker-{}", self.worker_id),
                node_type: NodeType::Slave,
                permissions: Permissions::SLAVE,
            },
            worker: Some(self.clone() as Arc<dyn WorkerConnection>),
            task_log_replica: None,
            record_replica: None,
        }
    }
}

#[async_trait]
impl WorkerConnection for TestWorker {
    async fn execute_task(&self, payload: TaskPayload) -> Result<(), WorkerError> {
        if self.reject.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(WorkerError::Communication {
                worker_id: self.worker_id,
                details: "connection refused".to_string(),
            });
        }
        self.received.lock().unwrap().push(payload.clone());
        if self.blackhole.load(Ordering::SeqCst) {
            return Ok(());
        }

        let registry = self.registry.clone();
        let cancelled = self.cancelled.clone();
        let fork_counter = self.fork_counter.clone();
        let leaf_delay = self.leaf_delay;
        let fork_delay = self.fork_delay;
        tokio::spawn(async move {
            let computation: TestComputation = match deserialize(&payload.body) {
                Ok(computation) => computation,
                Err(_) => return,
            };
            let delay = match computation {
                TestComputation::Leaf { .. } => leaf_delay,
                _ => fork_delay,
            };
            tokio::time::sleep(delay).await;
            if cancelled.lock().unwrap().contains(&payload.header.task_id) {
                return;
            }
            let outcome = match computation {
                TestComputation::Leaf { value } => TaskOutcome::Value(value),
                TestComputation::Fanout { values } => TaskOutcome::Spawn(
                    values
                        .into_iter()
                        .map(|value| TestComputation::Leaf { value })
                        .collect(),
                ),
                TestComputation::Fork => {
                    if let Some(counter) = &fork_counter {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    TaskOutcome::Spawn(vec![TestComputation::Fork, TestComputation::Fork])
                }
            };
            if let Some(task_manager) = registry.get(&payload.header.process_id) {
                task_manager.task_result(payload.header, serialize(&outcome).unwrap());
            }
        });
        Ok(())
    }

    async fn cancel_tasks(&self, task_ids: Vec<TaskId>) -> Result<(), WorkerError> {
        self.cancelled.lock().unwrap().extend(task_ids);
        Ok(())
    }
}

/// Scheduler used by the integration tests: runs the toy computation as a
/// root task plus at most one generation of children per spawn, aggregating
/// child values into the final result.
pub struct TestSchedulerFactory {
    pub registry: ManagerRegistry,
}

#[async_trait]
impl SchedulerFactory for TestSchedulerFactory {
    async fn activate(
        &self,
        process_id: ProcessId,
        task_manager: TaskManagerHandle,
        completion: CompletionSink,
    ) -> Result<SchedulerHandle, ActivationError> {
        self.registry.register(task_manager.clone());
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_scheduler(process_id, task_manager, completion, receiver));
        Ok(SchedulerHandle::new(sender))
    }
}

async fn run_scheduler(
    _process_id: ProcessId,
    task_manager: TaskManagerHandle,
    completion: CompletionSink,
    mut receiver: mpsc::UnboundedReceiver<SchedulerMessage>,
) {
    let mut root: Option<TaskId> = None;
    let mut pending: HashSet<TaskId> = HashSet::new();
    let mut collected: Vec<i64> = Vec::new();
    let mut expected = 0usize;

    while let Some(message) = receiver.recv().await {
        match message {
            SchedulerMessage::NewProcess { process_id, body } => {
                if deserialize::<TestComputation>(&body).is_err() {
                    completion
                        .complete(ProcessResult::InitError(
                            "failed to decode computation".to_string(),
                        ))
                        .await;
                    continue;
                }
                match task_manager.create_root_task(process_id, body).await {
                    Ok(task_id) => root = Some(task_id),
                    Err(err) => {
                        completion
                            .complete(ProcessResult::Fault(err.to_string()))
                            .await;
                    }
                }
            }
            SchedulerMessage::TaskResult { header, result } => {
                let outcome: TaskOutcome = match deserialize(&result) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        completion.complete(ProcessResult::Fault(err)).await;
                        continue;
                    }
                };
                match outcome {
                    TaskOutcome::Value(value) => {
                        if root == Some(header.task_id) {
                            if task_manager.final_task_complete(header.task_id).await.is_ok() {
                                completion
                                    .complete(ProcessResult::Success(
                                        serialize(&value).unwrap(),
                                    ))
                                    .await;
                            } else {
                                completion
                                    .complete(ProcessResult::Fault(
                                        "failed to settle final task".to_string(),
                                    ))
                                    .await;
                            }
                        } else {
                            pending.remove(&header.task_id);
                            collected.push(value);
                            if pending.is_empty() && expected > 0 && collected.len() == expected
                            {
                                if task_manager
                                    .final_task_complete(header.task_id)
                                    .await
                                    .is_ok()
                                {
                                    collected.sort();
                                    completion
                                        .complete(ProcessResult::Success(
                                            serialize(&collected).unwrap(),
                                        ))
                                        .await;
                                } else {
                                    completion
                                        .complete(ProcessResult::Fault(
                                            "failed to settle final task".to_string(),
                                        ))
                                        .await;
                                }
                            } else {
                                task_manager.leaf_task_complete(header.task_id);
                            }
                        }
                    }
                    TaskOutcome::Spawn(children) => {
                        let bodies = children
                            .iter()
                            .map(|child| serialize(child).unwrap())
                            .collect();
                        match task_manager.create_tasks(header, bodies).await {
                            Ok(task_ids) => {
                                expected += task_ids.len();
                                pending.extend(task_ids);
                            }
                            Err(err) => {
                                completion
                                    .complete(ProcessResult::Fault(err.to_string()))
                                    .await;
                            }
                        }
                    }
                }
            }
        }
    }
}

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        tracing: TracingConfig::test_pretty_without_time("mbrace-runtime-tests"),
        replication: ReplicationConfig {
            replication_factor: 2,
            failover_factor: 1,
            broadcast_timeout: Duration::from_secs(2),
        },
        dispatch_retry: RetryConfig {
            max_attempts: 10,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
        },
    }
}

pub struct TestEnv {
    pub cluster: Arc<ClusterManager>,
    pub services: Services,
    pub task_log_replicas: Vec<Arc<InMemoryTaskLogReplica>>,
    pub record_replicas: Vec<Arc<InMemoryRecordReplica>>,
    pub artifacts: Arc<InMemoryArtifactStore>,
    pub registry: ManagerRegistry,
}

/// Boots a master with three alt replicas and the given workers attached.
pub fn boot_cluster(registry: &ManagerRegistry, workers: &[Arc<TestWorker>]) -> TestEnv {
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let cluster = Arc::new(ClusterManager::new(
        test_config(),
        Arc::new(TestSchedulerFactory {
            registry: registry.clone(),
        }),
        Arc::new(InMemoryAssemblyManager::new()),
        artifacts.clone(),
    ));

    let task_log_replicas: Vec<Arc<InMemoryTaskLogReplica>> =
        (0..3).map(|_| Arc::new(InMemoryTaskLogReplica::new())).collect();
    let record_replicas: Vec<Arc<InMemoryRecordReplica>> =
        (0..3).map(|_| Arc::new(InMemoryRecordReplica::new())).collect();

    let mut nodes = Vec::new();
    for i in 0..3 {
        nodes.push(NodeRef {
            info: NodeInfo {
                node_id: NodeId::new_v4(),
                address: format!("alt-{i}"),
                node_type: NodeType::Alt,
                permissions: Permissions::MASTER,
            },
            worker: None,
            task_log_replica: Some(task_log_replicas[i].clone() as Arc<dyn Replica<TaskLogOp>>),
            record_replica: Some(record_replicas[i].clone() as Arc<dyn Replica<RecordOp>>),
        });
    }
    for worker in workers {
        nodes.push(worker.node_ref());
    }

    let services = cluster
        .master_boot(ClusterConfiguration {
            nodes,
            replication_factor: 2,
            failover_factor: 1,
        })
        .expect("master boot failed");

    TestEnv {
        cluster,
        services,
        task_log_replicas,
        record_replicas,
        artifacts,
        registry: registry.clone(),
    }
}

pub fn image_for(computation: &TestComputation) -> ProcessImage {
    ProcessImage {
        name: "test-computation".to_string(),
        computation: serialize(computation).unwrap(),
        return_type: serialize(&"i64".to_string()).unwrap(),
        type_name: "i64".to_string(),
        client_id: "test-client".to_string(),
        dependencies: vec![],
    }
}

impl TestEnv {
    pub fn process_manager(&self) -> &ProcessManagerHandle {
        &self.services.process_manager
    }

    pub async fn submit(
        &self,
        computation: &TestComputation,
    ) -> Result<ProcessInfo, ProcessManagerError> {
        self.submit_with_request(ClientRequestId::new_v4(), computation)
            .await
    }

    pub async fn submit_with_request(
        &self,
        request_id: ClientRequestId,
        computation: &TestComputation,
    ) -> Result<ProcessInfo, ProcessManagerError> {
        self.services
            .process_manager
            .create_dynamic_process(request_id, image_for(computation))
            .await
    }

    pub async fn await_state(
        &self,
        process_id: ProcessId,
        predicate: impl Fn(&ProcessInfo) -> bool,
        timeout: Duration,
    ) -> ProcessInfo {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last: Option<ProcessInfo> = None;
        while tokio::time::Instant::now() < deadline {
            if let Ok(info) = self
                .services
                .process_manager
                .get_process_info(process_id)
                .await
            {
                if predicate(&info) {
                    return info;
                }
                last = Some(info);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for process state, last seen: {last:?}");
    }

    pub async fn await_terminal(&self, process_id: ProcessId, timeout: Duration) -> ProcessInfo {
        self.await_state(process_id, |info| info.state.is_terminal(), timeout)
            .await
    }
}

/// A task manager wired directly to a pool and a single log replica, for
/// tests that drive the mailbox protocol without a process manager.
pub struct DirectManager {
    pub process_id: ProcessId,
    pub handle: TaskManagerHandle,
    pub pool: Arc<WorkerPool>,
    pub log: Arc<TaskLog>,
    pub monitor: Arc<ProcessMonitor>,
    pub replica: Arc<InMemoryTaskLogReplica>,
    pub scheduler_rx: mpsc::UnboundedReceiver<SchedulerMessage>,
}

pub async fn direct_manager(workers: &[Arc<TestWorker>]) -> DirectManager {
    let process_id = ProcessId::new_v4();
    let pool = Arc::new(WorkerPool::new());
    for worker in workers {
        pool.attach(worker.worker_ref());
    }

    let replication = ReplicationConfig {
        replication_factor: 1,
        failover_factor: 0,
        broadcast_timeout: Duration::from_secs(1),
    };
    let replica = Arc::new(InMemoryTaskLogReplica::new());
    let log = Arc::new(TaskLog::new(
        process_id,
        Replicator::new(
            vec![replica.clone() as Arc<dyn Replica<TaskLogOp>>],
            &replication,
        ),
    ));

    let no_replication = ReplicationConfig {
        replication_factor: 0,
        failover_factor: 0,
        broadcast_timeout: Duration::from_secs(1),
    };
    let monitor = Arc::new(ProcessMonitor::new(Replicator::new(vec![], &no_replication)));

    let retry = RetryConfig {
        max_attempts: 10,
        min_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
    };
    let handle = TaskManager::spawn(
        process_id,
        log.clone(),
        pool.clone(),
        monitor.clone(),
        retry,
        vec![],
    );

    let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
    handle.set_scheduler(SchedulerHandle::new(scheduler_tx));

    DirectManager {
        process_id,
        handle,
        pool,
        log,
        monitor,
        replica,
        scheduler_rx,
    }
}
