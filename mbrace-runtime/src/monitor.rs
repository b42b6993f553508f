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

use crate::replication::{BroadcastError, Replica, ReplicationMode, Replicator};
use async_trait::async_trait;
use mbrace_common::model::{ClientRequestId, ProcessId, ProcessRecord, ProcessResult, ProcessState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordOp {
    Upsert(ProcessRecord),
    Remove(ProcessId),
}

/// The process-record table. Records are persisted to quorum on admission
/// and on every state transition; state changes respect the monotone
/// lifecycle (an attempt to leave a terminal state is ignored).
pub struct ProcessMonitor {
    records: Mutex<HashMap<ProcessId, ProcessRecord>>,
    replicator: Replicator<RecordOp>,
}

impl ProcessMonitor {
    pub fn new(replicator: Replicator<RecordOp>) -> ProcessMonitor {
        ProcessMonitor {
            records: Mutex::new(HashMap::new()),
            replicator,
        }
    }

    pub fn get(&self, process_id: &ProcessId) -> Option<ProcessRecord> {
        self.records.lock().unwrap().get(process_id).cloned()
    }

    pub fn find_by_request(&self, request_id: &ClientRequestId) -> Option<ProcessRecord> {
        self.records
            .lock()
            .unwrap()
            .values()
            .find(|record| record.request_id == *request_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<ProcessRecord> =
            self.records.lock().unwrap().values().cloned().collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub async fn upsert(
        &self,
        record: ProcessRecord,
        mode: ReplicationMode,
    ) -> Result<(), BroadcastError> {
        self.records
            .lock()
            .unwrap()
            .insert(record.process_id, record.clone());
        self.replicator.broadcast(RecordOp::Upsert(record), mode).await
    }

    pub async fn update<F>(
        &self,
        process_id: ProcessId,
        f: F,
        mode: ReplicationMode,
    ) -> Result<Option<ProcessRecord>, BroadcastError>
    where
        F: FnOnce(&mut ProcessRecord),
    {
        let updated = {
            let mut records = self.records.lock().unwrap();
            records.get_mut(&process_id).map(|record| {
                f(record);
                record.clone()
            })
        };
        if let Some(record) = &updated {
            self.replicator
                .broadcast(RecordOp::Upsert(record.clone()), mode)
                .await?;
        }
        Ok(updated)
    }

    /// Applies the state change only if the monotone lifecycle admits it.
    pub async fn transition(
        &self,
        process_id: ProcessId,
        next: ProcessState,
        mode: ReplicationMode,
    ) -> Result<Option<ProcessRecord>, BroadcastError> {
        self.update(
            process_id,
            |record| {
                if record.state.can_transition(&next) {
                    record.state = next;
                }
            },
            mode,
        )
        .await
    }

    /// Settles the record with a terminal result. A record that already
    /// reached a terminal state is left untouched, which is what makes late
    /// completions racing a kill harmless.
    pub async fn finish(
        &self,
        process_id: ProcessId,
        result: ProcessResult,
        mode: ReplicationMode,
    ) -> Result<Option<ProcessRecord>, BroadcastError> {
        self.update(
            process_id,
            |record| {
                let state = result.terminal_state();
                if record.state.can_transition(&state) {
                    record.state = state;
                    record.result = Some(result);
                }
            },
            mode,
        )
        .await
    }

    pub async fn remove(
        &self,
        process_id: ProcessId,
        mode: ReplicationMode,
    ) -> Result<Option<ProcessRecord>, BroadcastError> {
        let removed = self.records.lock().unwrap().remove(&process_id);
        if removed.is_some() {
            self.replicator
                .broadcast(RecordOp::Remove(process_id), mode)
                .await?;
        }
        Ok(removed)
    }
}

/// Side-channel through which a scheduler delivers the terminal result of
/// its process.
#[derive(Clone)]
pub struct CompletionSink {
    monitor: Arc<ProcessMonitor>,
    process_id: ProcessId,
}

impl CompletionSink {
    pub fn new(monitor: Arc<ProcessMonitor>, process_id: ProcessId) -> CompletionSink {
        CompletionSink {
            monitor,
            process_id,
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub async fn complete(&self, result: ProcessResult) {
        if let Err(err) = self
            .monitor
            .finish(self.process_id, result, ReplicationMode::Sync)
            .await
        {
            error!(process_id = %self.process_id, %err, "failed to persist terminal process result");
        }
    }
}

/// Replica-side image of the record table.
pub struct InMemoryRecordReplica {
    records: Mutex<HashMap<ProcessId, ProcessRecord>>,
}

impl InMemoryRecordReplica {
    pub fn new() -> InMemoryRecordReplica {
        InMemoryRecordReplica {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, process_id: &ProcessId) -> Option<ProcessRecord> {
        self.records.lock().unwrap().get(process_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl Default for InMemoryRecordReplica {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Replica<RecordOp> for InMemoryRecordReplica {
    async fn apply(&self, op: RecordOp) -> Result<(), String> {
        let mut records = self.records.lock().unwrap();
        match op {
            RecordOp::Upsert(record) => {
                records.insert(record.process_id, record);
            }
            RecordOp::Remove(process_id) => {
                records.remove(&process_id);
            }
        }
        Ok(())
    }
}
