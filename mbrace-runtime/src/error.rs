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

use crate::replication::BroadcastError;
use mbrace_common::model::{ProcessId, WorkerId};
use mbrace_common::SafeDisplay;

/// Failures observed while talking to a worker node. Both variants are
/// transient from the runtime's point of view: the dispatch site converts
/// them into a retry and they are never surfaced to clients.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("communication with worker {worker_id} failed: {details}")]
    Communication { worker_id: WorkerId, details: String },
    #[error("worker {worker_id} reported failure: {details}")]
    Failure { worker_id: WorkerId, details: String },
}

impl WorkerError {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            WorkerError::Communication { worker_id, .. } => *worker_id,
            WorkerError::Failure { worker_id, .. } => *worker_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    #[error("task manager for process {0} is not available")]
    ManagerUnavailable(ProcessId),
}

#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("failed to activate process {process_id}: {details}")]
    FailedToActivate {
        process_id: ProcessId,
        details: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster is already booted")]
    AlreadyBooted,
    #[error("master boot failed: {0}")]
    BootFailed(String),
}

/// Client-visible errors of the process manager, mapped per the error
/// taxonomy: activation failures and invalid requests are recoverable,
/// `SystemFailed` marks a failed subsystem, `SystemCorrupted` is the reply
/// sent while the manager deactivates itself.
#[derive(Debug, thiserror::Error)]
pub enum ProcessManagerError {
    #[error("unknown process: {0}")]
    UnknownProcess(ProcessId),
    #[error("process {0} has not reached a terminal state")]
    ProcessStillRunning(ProcessId),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to activate process: {0}")]
    FailedToActivate(String),
    #[error("system failure: {0}")]
    SystemFailed(String),
    #[error("system corrupted")]
    SystemCorrupted,
}

impl SafeDisplay for ProcessManagerError {
    fn to_safe_string(&self) -> String {
        match self {
            ProcessManagerError::UnknownProcess(_) => self.to_string(),
            ProcessManagerError::ProcessStillRunning(_) => self.to_string(),
            ProcessManagerError::InvalidRequest(_) => self.to_string(),
            ProcessManagerError::FailedToActivate(_) => self.to_string(),
            ProcessManagerError::SystemFailed(_) => "system failure".to_string(),
            ProcessManagerError::SystemCorrupted => self.to_string(),
        }
    }
}

impl From<ActivationError> for ProcessManagerError {
    fn from(value: ActivationError) -> Self {
        ProcessManagerError::FailedToActivate(value.to_string())
    }
}
