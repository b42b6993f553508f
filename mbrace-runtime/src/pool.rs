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

use crate::error::WorkerError;
use crate::metrics;
use async_trait::async_trait;
use mbrace_common::model::{Permissions, TaskId, TaskPayload, WorkerId};
use std::collections::HashMap;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::info;

/// Transport to one executor node. Implementations are provided by the node
/// communication layer; `execute_task` acknowledges acceptance only, the
/// result arrives later as a `TaskResult` message at the owning task manager.
#[async_trait]
pub trait WorkerConnection: Send + Sync {
    async fn execute_task(&self, payload: TaskPayload) -> Result<(), WorkerError>;
    async fn cancel_tasks(&self, task_ids: Vec<TaskId>) -> Result<(), WorkerError>;
}

#[derive(Clone)]
pub struct WorkerRef {
    pub worker_id: WorkerId,
    pub address: String,
    pub permissions: Permissions,
    pub connection: Arc<dyn WorkerConnection>,
}

impl Debug for WorkerRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRef")
            .field("worker_id", &self.worker_id)
            .field("address", &self.address)
            .field("permissions", &self.permissions)
            .finish()
    }
}

struct PoolEntry {
    worker: WorkerRef,
    in_flight: usize,
}

/// Membership view of the live executor nodes. Selection picks the
/// least-loaded eligible worker; batch selection is all-or-nothing because
/// parallel task groups are logged atomically and must be able to complete.
/// Worker failures are broadcast to every subscribed task manager.
pub struct WorkerPool {
    state: Mutex<HashMap<WorkerId, PoolEntry>>,
    failures: broadcast::Sender<WorkerId>,
}

impl WorkerPool {
    pub fn new() -> WorkerPool {
        let (failures, _) = broadcast::channel(1024);
        WorkerPool {
            state: Mutex::new(HashMap::new()),
            failures,
        }
    }

    pub fn attach(&self, worker: WorkerRef) {
        let mut state = self.state.lock().unwrap();
        state.insert(
            worker.worker_id,
            PoolEntry {
                worker,
                in_flight: 0,
            },
        );
    }

    pub fn detach(&self, worker_id: &WorkerId) -> Option<WorkerRef> {
        let mut state = self.state.lock().unwrap();
        state.remove(worker_id).map(|entry| entry.worker)
    }

    pub fn set_permissions(&self, worker_id: &WorkerId, permissions: Permissions) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.get_mut(worker_id) {
            Some(entry) => {
                entry.worker.permissions = permissions;
                true
            }
            None => false,
        }
    }

    pub fn worker(&self, worker_id: &WorkerId) -> Option<WorkerRef> {
        let state = self.state.lock().unwrap();
        state.get(worker_id).map(|entry| entry.worker.clone())
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.state.lock().unwrap().keys().copied().collect()
    }

    pub fn select(&self) -> Option<WorkerRef> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .values_mut()
            .filter(|entry| entry.worker.permissions.can_execute_tasks())
            .min_by_key(|entry| entry.in_flight)?;
        entry.in_flight += 1;
        Some(entry.worker.clone())
    }

    /// Reserves `n` distinct workers or none at all.
    pub fn select_many(&self, n: usize) -> Option<Vec<WorkerRef>> {
        let mut state = self.state.lock().unwrap();
        let mut eligible: Vec<&mut PoolEntry> = state
            .values_mut()
            .filter(|entry| entry.worker.permissions.can_execute_tasks())
            .collect();
        if eligible.len() < n {
            return None;
        }
        eligible.sort_by_key(|entry| entry.in_flight);
        Some(
            eligible
                .into_iter()
                .take(n)
                .map(|entry| {
                    entry.in_flight += 1;
                    entry.worker.clone()
                })
                .collect(),
        )
    }

    /// Returns a previously selected worker's slot; called when the task it
    /// was reserved for completes, is cancelled or is reassigned.
    pub fn release(&self, worker_id: &WorkerId) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.get_mut(worker_id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    pub fn available_worker_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .values()
            .filter(|entry| entry.worker.permissions.can_execute_tasks())
            .count()
    }

    pub fn on_worker_failure(&self, worker_id: &WorkerId) -> bool {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.remove(worker_id).is_some()
        };
        if removed {
            info!(worker_id = %worker_id, "worker removed from pool after failure");
            metrics::record_worker_failure();
            let _ = self.failures.send(*worker_id);
        }
        removed
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<WorkerId> {
        self.failures.subscribe()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    struct NoopConnection;

    #[async_trait]
    impl WorkerConnection for NoopConnection {
        async fn execute_task(&self, _payload: TaskPayload) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn cancel_tasks(&self, _task_ids: Vec<TaskId>) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    fn worker(permissions: Permissions) -> WorkerRef {
        WorkerRef {
            worker_id: WorkerId::new_v4(),
            address: "localhost:0".to_string(),
            permissions,
            connection: Arc::new(NoopConnection),
        }
    }

    #[test]
    fn selection_skips_workers_without_slave_permission() {
        let pool = WorkerPool::new();
        pool.attach(worker(Permissions::empty()));
        pool.attach(worker(Permissions::MASTER));
        assert_eq!(pool.available_worker_count(), 0);
        assert!(pool.select().is_none());

        let slave = worker(Permissions::SLAVE);
        let slave_id = slave.worker_id;
        pool.attach(slave);
        assert_eq!(pool.select().unwrap().worker_id, slave_id);
    }

    #[test]
    fn selection_prefers_the_least_loaded_worker() {
        let pool = WorkerPool::new();
        let a = worker(Permissions::SLAVE);
        let b = worker(Permissions::SLAVE);
        let a_id = a.worker_id;
        let b_id = b.worker_id;
        pool.attach(a);
        pool.attach(b);

        let first = pool.select().unwrap().worker_id;
        let second = pool.select().unwrap().worker_id;
        assert_ne!(first, second);

        pool.release(&a_id);
        assert_eq!(pool.select().unwrap().worker_id, a_id);
        let _ = b_id;
    }

    #[test]
    fn batch_selection_is_all_or_nothing() {
        let pool = WorkerPool::new();
        pool.attach(worker(Permissions::SLAVE));
        pool.attach(worker(Permissions::SLAVE));
        pool.attach(worker(Permissions::empty()));

        assert!(pool.select_many(3).is_none());

        let selected = pool.select_many(2).unwrap();
        assert_eq!(selected.len(), 2);
        assert_ne!(selected[0].worker_id, selected[1].worker_id);
    }

    #[test]
    async fn worker_failure_is_broadcast() {
        let pool = WorkerPool::new();
        let w = worker(Permissions::SLAVE);
        let worker_id = w.worker_id;
        pool.attach(w);

        let mut failures = pool.subscribe_failures();
        assert!(pool.on_worker_failure(&worker_id));
        assert_eq!(failures.recv().await.unwrap(), worker_id);
        assert_eq!(pool.available_worker_count(), 0);

        // already removed, no duplicate event
        assert!(!pool.on_worker_failure(&worker_id));
    }
}
