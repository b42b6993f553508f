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

use crate::error::TaskError;
use crate::metrics;
use crate::monitor::ProcessMonitor;
use crate::pool::{WorkerPool, WorkerRef};
use crate::replication::ReplicationMode;
use crate::scheduler::{SchedulerHandle, SchedulerMessage};
use crate::tasklog::TaskLog;
use mbrace_common::config::RetryConfig;
use mbrace_common::model::{
    AssemblyId, ProcessId, ProcessState, TaskHeader, TaskId, TaskLogEntry, TaskPayload, WorkerId,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

const CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Mailbox protocol of a per-process task manager.
pub enum TaskManagerMessage {
    CreateRootTask {
        reply: oneshot::Sender<Result<TaskId, TaskError>>,
        process_id: ProcessId,
        body: Vec<u8>,
        attempt: u32,
    },
    CreateTasks {
        reply: oneshot::Sender<Result<Vec<TaskId>, TaskError>>,
        parent: TaskHeader,
        bodies: Vec<Vec<u8>>,
        attempt: u32,
    },
    LeafTaskComplete {
        task_id: TaskId,
    },
    FinalTaskComplete {
        reply: oneshot::Sender<Result<(), TaskError>>,
        task_id: TaskId,
    },
    TaskResult {
        header: TaskHeader,
        result: Vec<u8>,
    },
    RetryTask {
        payload: TaskPayload,
        parent: Option<TaskId>,
        recovery: bool,
        attempt: u32,
    },
    Recover {
        worker_id: WorkerId,
    },
    CancelSiblingTasks {
        reply: oneshot::Sender<Result<(), TaskError>>,
        task_id: TaskId,
    },
    IsValidTask {
        reply: oneshot::Sender<bool>,
        task_id: TaskId,
    },
    GetActiveTaskCount {
        reply: oneshot::Sender<usize>,
    },
    SetScheduler {
        scheduler: SchedulerHandle,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct TaskManagerHandle {
    process_id: ProcessId,
    sender: mpsc::UnboundedSender<TaskManagerMessage>,
}

impl TaskManagerHandle {
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn send(&self, message: TaskManagerMessage) -> bool {
        self.sender.send(message).is_ok()
    }

    pub async fn create_root_task(
        &self,
        process_id: ProcessId,
        body: Vec<u8>,
    ) -> Result<TaskId, TaskError> {
        let (reply, receiver) = oneshot::channel();
        self.send(TaskManagerMessage::CreateRootTask {
            reply,
            process_id,
            body,
            attempt: 0,
        });
        receiver
            .await
            .map_err(|_| TaskError::ManagerUnavailable(self.process_id))?
    }

    pub async fn create_tasks(
        &self,
        parent: TaskHeader,
        bodies: Vec<Vec<u8>>,
    ) -> Result<Vec<TaskId>, TaskError> {
        let (reply, receiver) = oneshot::channel();
        self.send(TaskManagerMessage::CreateTasks {
            reply,
            parent,
            bodies,
            attempt: 0,
        });
        receiver
            .await
            .map_err(|_| TaskError::ManagerUnavailable(self.process_id))?
    }

    pub fn leaf_task_complete(&self, task_id: TaskId) {
        self.send(TaskManagerMessage::LeafTaskComplete { task_id });
    }

    pub async fn final_task_complete(&self, task_id: TaskId) -> Result<(), TaskError> {
        let (reply, receiver) = oneshot::channel();
        self.send(TaskManagerMessage::FinalTaskComplete { reply, task_id });
        receiver
            .await
            .map_err(|_| TaskError::ManagerUnavailable(self.process_id))?
    }

    pub fn task_result(&self, header: TaskHeader, result: Vec<u8>) {
        self.send(TaskManagerMessage::TaskResult { header, result });
    }

    pub async fn cancel_sibling_tasks(&self, task_id: TaskId) -> Result<(), TaskError> {
        let (reply, receiver) = oneshot::channel();
        self.send(TaskManagerMessage::CancelSiblingTasks { reply, task_id });
        receiver
            .await
            .map_err(|_| TaskError::ManagerUnavailable(self.process_id))?
    }

    pub async fn is_valid_task(&self, task_id: TaskId) -> bool {
        let (reply, receiver) = oneshot::channel();
        self.send(TaskManagerMessage::IsValidTask { reply, task_id });
        receiver.await.unwrap_or(false)
    }

    pub async fn active_task_count(&self) -> usize {
        let (reply, receiver) = oneshot::channel();
        self.send(TaskManagerMessage::GetActiveTaskCount { reply });
        receiver.await.unwrap_or(0)
    }

    pub fn set_scheduler(&self, scheduler: SchedulerHandle) {
        self.send(TaskManagerMessage::SetScheduler { scheduler });
    }

    /// Unlogs every outstanding task, cancels it on its worker and stops the
    /// actor. Returns once teardown finished.
    pub async fn shutdown(&self) {
        let (reply, receiver) = oneshot::channel();
        if self.send(TaskManagerMessage::Shutdown { reply }) {
            let _ = receiver.await;
        }
    }
}

/// The state machine driving every task of one process from dispatch to
/// completion.
///
/// Ordering rules the recovery protocol relies on:
/// - a task is logged (to quorum) before its payload is posted, so a failed
///   post never loses the task;
/// - children are logged before their parent is unlogged, so a crash
///   between the two leaves the parent reissuable;
/// - `retry_requested` holds at most one pending reissue per task, making
///   duplicate retry messages no-ops;
/// - `processing` marks tasks whose result already reached the scheduler,
///   excluding them from worker-failure recovery.
pub struct TaskManager {
    process_id: ProcessId,
    log: Arc<TaskLog>,
    pool: Arc<WorkerPool>,
    monitor: Arc<ProcessMonitor>,
    retry: RetryConfig,
    dependencies: Vec<AssemblyId>,
    scheduler: Option<SchedulerHandle>,
    retry_requested: HashSet<TaskId>,
    processing: HashSet<TaskId>,
    self_sender: mpsc::UnboundedSender<TaskManagerMessage>,
}

impl TaskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        process_id: ProcessId,
        log: Arc<TaskLog>,
        pool: Arc<WorkerPool>,
        monitor: Arc<ProcessMonitor>,
        retry: RetryConfig,
        dependencies: Vec<AssemblyId>,
    ) -> TaskManagerHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let failures = pool.subscribe_failures();
        let manager = TaskManager {
            process_id,
            log,
            pool,
            monitor,
            retry,
            dependencies,
            scheduler: None,
            retry_requested: HashSet::new(),
            processing: HashSet::new(),
            self_sender: sender.clone(),
        };
        tokio::spawn(manager.run(receiver, failures));
        TaskManagerHandle { process_id, sender }
    }

    async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<TaskManagerMessage>,
        mut failures: broadcast::Receiver<WorkerId>,
    ) {
        let mut failures_open = true;
        loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(TaskManagerMessage::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                failure = failures.recv(), if failures_open => match failure {
                    Ok(worker_id) => {
                        self.handle(TaskManagerMessage::Recover { worker_id }).await
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(process_id = %self.process_id, missed, "worker failure events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        failures_open = false;
                    }
                },
            }
        }
        debug!(process_id = %self.process_id, "task manager stopped");
    }

    async fn handle(&mut self, message: TaskManagerMessage) {
        match message {
            TaskManagerMessage::CreateRootTask {
                reply,
                process_id,
                body,
                attempt,
            } => {
                let Some(worker) = self.pool.select() else {
                    self.requeue(
                        TaskManagerMessage::CreateRootTask {
                            reply,
                            process_id,
                            body,
                            attempt: attempt + 1,
                        },
                        attempt,
                    );
                    return;
                };
                let task_id = TaskId::new_v4();
                let payload = TaskPayload {
                    header: TaskHeader {
                        process_id,
                        task_id,
                    },
                    body,
                    dependencies: self.dependencies.clone(),
                };
                let entry = TaskLogEntry {
                    task_id,
                    parent: None,
                    worker_id: worker.worker_id,
                    payload: payload.clone(),
                };
                match self.log.log(vec![entry], ReplicationMode::Sync).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(task_id));
                        metrics::record_task_dispatched();
                        self.post_task(&worker, payload, None).await;
                    }
                    Err(err) => {
                        self.pool.release(&worker.worker_id);
                        error!(task_id = %task_id, %err, "failed to log root task");
                        self.fail_process(format!("task log replication failed: {err}"))
                            .await;
                        let _ = reply.send(Err(err.into()));
                    }
                }
            }

            TaskManagerMessage::CreateTasks {
                reply,
                parent,
                bodies,
                attempt,
            } => {
                if bodies.is_empty() {
                    let _ = reply.send(Ok(Vec::new()));
                    return;
                }
                let Some(workers) = self.pool.select_many(bodies.len()) else {
                    self.requeue(
                        TaskManagerMessage::CreateTasks {
                            reply,
                            parent,
                            bodies,
                            attempt: attempt + 1,
                        },
                        attempt,
                    );
                    return;
                };

                let mut entries = Vec::with_capacity(bodies.len());
                let mut posts = Vec::with_capacity(bodies.len());
                for (worker, body) in workers.into_iter().zip(bodies) {
                    let task_id = TaskId::new_v4();
                    let payload = TaskPayload {
                        header: TaskHeader {
                            process_id: parent.process_id,
                            task_id,
                        },
                        body,
                        dependencies: self.dependencies.clone(),
                    };
                    entries.push(TaskLogEntry {
                        task_id,
                        parent: Some(parent.task_id),
                        worker_id: worker.worker_id,
                        payload: payload.clone(),
                    });
                    posts.push((worker, payload));
                }

                // children first; only then may the parent leave the log
                match self.log.log(entries, ReplicationMode::Sync).await {
                    Ok(()) => {
                        let task_ids = posts
                            .iter()
                            .map(|(_, payload)| payload.header.task_id)
                            .collect();
                        let _ = reply.send(Ok(task_ids));

                        if let Some(parent_entry) = self.log.get(&parent.task_id) {
                            self.pool.release(&parent_entry.worker_id);
                        }
                        if let Err(err) = self
                            .log
                            .unlog(vec![parent.task_id], ReplicationMode::Async)
                            .await
                        {
                            warn!(parent = %parent, %err, "failed to unlog parent task");
                        }
                        self.processing.remove(&parent.task_id);
                        self.retry_requested.remove(&parent.task_id);

                        for (worker, payload) in posts {
                            metrics::record_task_dispatched();
                            self.post_task(&worker, payload, Some(parent.task_id)).await;
                        }
                    }
                    Err(err) => {
                        for (worker, _) in &posts {
                            self.pool.release(&worker.worker_id);
                        }
                        error!(parent = %parent, %err, "failed to log child tasks");
                        self.fail_process(format!("task log replication failed: {err}"))
                            .await;
                        let _ = reply.send(Err(err.into()));
                    }
                }
            }

            TaskManagerMessage::LeafTaskComplete { task_id } => {
                if let Some(entry) = self.log.get(&task_id) {
                    self.pool.release(&entry.worker_id);
                }
                if let Err(err) = self.log.unlog(vec![task_id], ReplicationMode::Async).await {
                    warn!(task_id = %task_id, %err, "failed to unlog completed leaf task");
                }
                self.processing.remove(&task_id);
                self.retry_requested.remove(&task_id);
            }

            TaskManagerMessage::FinalTaskComplete { reply, task_id } => {
                if let Some(entry) = self.log.get(&task_id) {
                    self.pool.release(&entry.worker_id);
                }
                let result = self.log.unlog(vec![task_id], ReplicationMode::Sync).await;
                if let Err(err) = &result {
                    error!(task_id = %task_id, %err, "failed to unlog final task");
                    self.fail_process(format!("task log replication failed: {err}"))
                        .await;
                }
                self.processing.remove(&task_id);
                self.retry_requested.remove(&task_id);
                let _ = reply.send(result.map_err(TaskError::from));
            }

            TaskManagerMessage::TaskResult { header, result } => {
                if self.log.is_logged(&header.task_id) {
                    self.processing.insert(header.task_id);
                    match &self.scheduler {
                        Some(scheduler) => {
                            if !scheduler.send(SchedulerMessage::TaskResult { header, result }) {
                                warn!(task = %header, "scheduler is gone, task result dropped");
                            }
                        }
                        None => {
                            warn!(task = %header, "no scheduler installed, task result dropped")
                        }
                    }
                } else {
                    warn!(task = %header, "result for a task not in the log, dropping duplicate");
                    metrics::record_duplicate_task_result();
                }
            }

            TaskManagerMessage::RetryTask {
                payload,
                parent,
                recovery,
                attempt,
            } => {
                let task_id = payload.header.task_id;
                if !self.retry_requested.contains(&task_id) {
                    debug!(task_id = %task_id, "duplicate retry request, ignoring");
                    return;
                }
                if !self.log.is_logged(&task_id) {
                    // completed or cancelled while the retry was queued
                    self.retry_requested.remove(&task_id);
                    return;
                }
                let Some(worker) = self.pool.select() else {
                    self.requeue(
                        TaskManagerMessage::RetryTask {
                            payload,
                            parent,
                            recovery,
                            attempt: attempt + 1,
                        },
                        attempt,
                    );
                    return;
                };
                let entry = TaskLogEntry {
                    task_id,
                    parent,
                    worker_id: worker.worker_id,
                    payload: payload.clone(),
                };
                match self.log.log(vec![entry], ReplicationMode::Sync).await {
                    Ok(()) => {
                        self.retry_requested.remove(&task_id);
                        metrics::record_task_retried();
                        info!(task = %payload.header, worker_id = %worker.worker_id, "task reassigned");
                        if recovery {
                            self.recovery_settled().await;
                        }
                        self.post_task(&worker, payload, parent).await;
                    }
                    Err(err) => {
                        self.pool.release(&worker.worker_id);
                        error!(task = %payload.header, %err, "failed to relog task during retry");
                        self.fail_process(format!("task log replication failed: {err}"))
                            .await;
                    }
                }
            }

            TaskManagerMessage::Recover { worker_id } => {
                let entries = self.log.entries_for_worker(&worker_id);
                let mut reissued = 0u32;
                for entry in entries {
                    if self.processing.contains(&entry.task_id) {
                        // the result already reached the scheduler, only its
                        // settlement is outstanding
                        continue;
                    }
                    if self.retry_requested.insert(entry.task_id) {
                        reissued += 1;
                        let _ = self.self_sender.send(TaskManagerMessage::RetryTask {
                            payload: entry.payload,
                            parent: entry.parent,
                            recovery: true,
                            attempt: 0,
                        });
                    }
                }
                if reissued > 0 {
                    info!(
                        process_id = %self.process_id,
                        worker_id = %worker_id,
                        reissued,
                        "recovering tasks from failed worker"
                    );
                    metrics::record_tasks_recovered(reissued as u64);
                    let _ = self
                        .monitor
                        .update(
                            self.process_id,
                            |record| match record.state {
                                ProcessState::Running => {
                                    record.state = ProcessState::Recovering(reissued)
                                }
                                ProcessState::Recovering(outstanding) => {
                                    record.state =
                                        ProcessState::Recovering(outstanding + reissued)
                                }
                                _ => {}
                            },
                            ReplicationMode::Async,
                        )
                        .await;
                }
            }

            TaskManagerMessage::CancelSiblingTasks { reply, task_id } => {
                let siblings = self.log.sibling_tasks(&task_id);
                if siblings.is_empty() {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let task_ids: Vec<TaskId> = siblings.iter().map(|entry| entry.task_id).collect();
                match self.log.unlog(task_ids.clone(), ReplicationMode::Sync).await {
                    Ok(()) => {
                        for id in &task_ids {
                            self.processing.remove(id);
                            self.retry_requested.remove(id);
                        }
                        self.cancel_on_workers(&siblings).await;
                        let _ = reply.send(Ok(()));
                    }
                    Err(err) => {
                        error!(task_id = %task_id, %err, "failed to unlog sibling tasks");
                        self.fail_process(format!("task log replication failed: {err}"))
                            .await;
                        let _ = reply.send(Err(err.into()));
                    }
                }
            }

            TaskManagerMessage::IsValidTask { reply, task_id } => {
                let _ = reply.send(self.log.is_logged(&task_id));
            }

            TaskManagerMessage::GetActiveTaskCount { reply } => {
                let _ = reply.send(self.log.count());
            }

            TaskManagerMessage::SetScheduler { scheduler } => {
                self.scheduler = Some(scheduler);
            }

            TaskManagerMessage::Shutdown { reply } => {
                // handled in the run loop; only reachable through direct use
                self.teardown().await;
                let _ = reply.send(());
            }
        }
    }

    /// Sends the payload to its worker. Posting happens strictly after
    /// logging, so a failed post leaves the task in the log and the retry
    /// path reassigns it.
    async fn post_task(
        &mut self,
        worker: &WorkerRef,
        payload: TaskPayload,
        parent: Option<TaskId>,
    ) {
        let task_id = payload.header.task_id;
        if let Err(err) = worker.connection.execute_task(payload.clone()).await {
            warn!(
                task = %payload.header,
                worker_id = %worker.worker_id,
                %err,
                "failed to post task, scheduling retry"
            );
            self.pool.release(&worker.worker_id);
            if self.retry_requested.insert(task_id) {
                let _ = self.self_sender.send(TaskManagerMessage::RetryTask {
                    payload,
                    parent,
                    recovery: false,
                    attempt: 0,
                });
            }
        }
    }

    /// Re-enqueues a message to the own mailbox after a backoff delay; the
    /// non-blocking substitute for waiting on worker availability.
    fn requeue(&self, message: TaskManagerMessage, attempt: u32) {
        let delay = self.retry.delay(attempt);
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(message);
        });
    }

    /// One recovery reissue settled; drop the transient overlay once the
    /// count reaches zero.
    async fn recovery_settled(&self) {
        let _ = self
            .monitor
            .update(
                self.process_id,
                |record| {
                    if let ProcessState::Recovering(outstanding) = record.state {
                        record.state = if outstanding <= 1 {
                            ProcessState::Running
                        } else {
                            ProcessState::Recovering(outstanding - 1)
                        };
                    }
                },
                ReplicationMode::Async,
            )
            .await;
    }

    async fn fail_process(&self, details: String) {
        error!(process_id = %self.process_id, details, "process failed");
        let _ = self
            .monitor
            .finish(
                self.process_id,
                mbrace_common::model::ProcessResult::Fault(details),
                ReplicationMode::Async,
            )
            .await;
    }

    async fn cancel_on_workers(&self, entries: &[TaskLogEntry]) {
        let mut by_worker: HashMap<WorkerId, Vec<TaskId>> = HashMap::new();
        for entry in entries {
            by_worker
                .entry(entry.worker_id)
                .or_default()
                .push(entry.task_id);
            self.pool.release(&entry.worker_id);
        }

        let mut cancels = Vec::with_capacity(by_worker.len());
        for (worker_id, task_ids) in by_worker {
            if let Some(worker) = self.pool.worker(&worker_id) {
                cancels.push(async move {
                    if let Err(err) = worker.connection.cancel_tasks(task_ids).await {
                        warn!(worker_id = %worker.worker_id, %err, "worker-side cancellation failed");
                    }
                });
            }
        }
        if tokio::time::timeout(CANCEL_TIMEOUT, futures::future::join_all(cancels))
            .await
            .is_err()
        {
            warn!(process_id = %self.process_id, "worker-side cancellation timed out");
        }
    }

    async fn teardown(&mut self) {
        let entries = self.log.all_entries();
        if !entries.is_empty() {
            info!(
                process_id = %self.process_id,
                outstanding = entries.len(),
                "tearing down task manager, cancelling outstanding tasks"
            );
            let task_ids: Vec<TaskId> = entries.iter().map(|entry| entry.task_id).collect();
            if let Err(err) = self.log.unlog(task_ids, ReplicationMode::Sync).await {
                warn!(process_id = %self.process_id, %err, "failed to unlog tasks during teardown");
            }
            self.cancel_on_workers(&entries).await;
        }
        self.scheduler = None;
        self.retry_requested.clear();
        self.processing.clear();
    }
}
