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

use crate::metrics;
use crate::replication::{BroadcastError, Replica, ReplicationMode, Replicator};
use async_trait::async_trait;
use mbrace_common::model::{ProcessId, TaskId, TaskLogEntry, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskLogOp {
    Log(Vec<TaskLogEntry>),
    Unlog(Vec<TaskId>),
}

/// The record of every dispatched-but-unacknowledged task of one process.
/// The primary image lives with the owning task manager and answers queries;
/// every mutation is pushed through the replicator with the caller's
/// replication directive.
///
/// `log` upserts by task id (re-logging an id replaces the entry, which is
/// how a retry reassigns a task to a fresh worker) and `unlog` ignores
/// missing ids, so both operations are idempotent under duplicate delivery.
pub struct TaskLog {
    process_id: ProcessId,
    entries: Mutex<HashMap<TaskId, TaskLogEntry>>,
    replicator: Replicator<TaskLogOp>,
    logged_total: AtomicU64,
    unlogged_total: AtomicU64,
}

impl TaskLog {
    pub fn new(process_id: ProcessId, replicator: Replicator<TaskLogOp>) -> TaskLog {
        TaskLog {
            process_id,
            entries: Mutex::new(HashMap::new()),
            replicator,
            logged_total: AtomicU64::new(0),
            unlogged_total: AtomicU64::new(0),
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub async fn log(
        &self,
        entries: Vec<TaskLogEntry>,
        mode: ReplicationMode,
    ) -> Result<(), BroadcastError> {
        {
            let mut map = self.entries.lock().unwrap();
            for entry in &entries {
                if map.insert(entry.task_id, entry.clone()).is_none() {
                    self.logged_total.fetch_add(1, Ordering::Relaxed);
                }
            }
            metrics::record_task_log_size(map.len());
        }
        self.replicator.broadcast(TaskLogOp::Log(entries), mode).await
    }

    pub async fn unlog(
        &self,
        task_ids: Vec<TaskId>,
        mode: ReplicationMode,
    ) -> Result<(), BroadcastError> {
        {
            let mut map = self.entries.lock().unwrap();
            for task_id in &task_ids {
                if map.remove(task_id).is_some() {
                    self.unlogged_total.fetch_add(1, Ordering::Relaxed);
                }
            }
            metrics::record_task_log_size(map.len());
        }
        self.replicator
            .broadcast(TaskLogOp::Unlog(task_ids), mode)
            .await
    }

    pub fn is_logged(&self, task_id: &TaskId) -> bool {
        self.entries.lock().unwrap().contains_key(task_id)
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskLogEntry> {
        self.entries.lock().unwrap().get(task_id).cloned()
    }

    pub fn entries_for_worker(&self, worker_id: &WorkerId) -> Vec<TaskLogEntry> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.worker_id == *worker_id)
            .cloned()
            .collect()
    }

    /// All entries sharing the given task's parent, the task itself included.
    pub fn sibling_tasks(&self, task_id: &TaskId) -> Vec<TaskLogEntry> {
        let map = self.entries.lock().unwrap();
        match map.get(task_id) {
            Some(entry) => {
                let parent = entry.parent;
                map.values()
                    .filter(|candidate| candidate.parent == parent)
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn all_entries(&self) -> Vec<TaskLogEntry> {
        self.entries.lock().unwrap().values().cloned().collect()
    }

    /// Number of distinct task ids ever logged / unlogged. For any quiescent
    /// process `logged == unlogged + count()`.
    pub fn op_counts(&self) -> (u64, u64) {
        (
            self.logged_total.load(Ordering::Relaxed),
            self.unlogged_total.load(Ordering::Relaxed),
        )
    }

    pub fn is_degraded(&self) -> bool {
        self.replicator.is_degraded()
    }
}

/// Replica-side image of a task log, also usable standalone in tests.
pub struct InMemoryTaskLogReplica {
    entries: Mutex<HashMap<TaskId, TaskLogEntry>>,
    logged_total: AtomicU64,
    unlogged_total: AtomicU64,
}

impl InMemoryTaskLogReplica {
    pub fn new() -> InMemoryTaskLogReplica {
        InMemoryTaskLogReplica {
            entries: Mutex::new(HashMap::new()),
            logged_total: AtomicU64::new(0),
            unlogged_total: AtomicU64::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.entries.lock().unwrap().contains_key(task_id)
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskLogEntry> {
        self.entries.lock().unwrap().get(task_id).cloned()
    }

    pub fn op_counts(&self) -> (u64, u64) {
        (
            self.logged_total.load(Ordering::Relaxed),
            self.unlogged_total.load(Ordering::Relaxed),
        )
    }
}

impl Default for InMemoryTaskLogReplica {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Replica<TaskLogOp> for InMemoryTaskLogReplica {
    async fn apply(&self, op: TaskLogOp) -> Result<(), String> {
        let mut entries = self.entries.lock().unwrap();
        match op {
            TaskLogOp::Log(new_entries) => {
                for entry in new_entries {
                    if entries.insert(entry.task_id, entry).is_none() {
                        self.logged_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            TaskLogOp::Unlog(task_ids) => {
                for task_id in task_ids {
                    if entries.remove(&task_id).is_some() {
                        self.unlogged_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        Ok(())
    }
}
