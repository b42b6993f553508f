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

use crate::error::ActivationError;
use crate::monitor::CompletionSink;
use crate::task_manager::TaskManagerHandle;
use async_trait::async_trait;
use mbrace_common::model::{ProcessId, TaskHeader};
use tokio::sync::mpsc;

/// Contract of the per-process scheduler. The scheduler interprets the
/// opaque computation: it receives `NewProcess` exactly once, then one
/// `TaskResult` per executed task, and reacts to each result with exactly
/// one call back into the task manager (`create_tasks`,
/// `leaf_task_complete` or `final_task_complete`), delivering the terminal
/// result through its completion sink.
///
/// Teardown rides channel closure: when the process is deactivated the
/// runtime drops its `SchedulerHandle` and the implementation is expected to
/// exit once its mailbox closes.
#[derive(Debug)]
pub enum SchedulerMessage {
    NewProcess { process_id: ProcessId, body: Vec<u8> },
    TaskResult { header: TaskHeader, result: Vec<u8> },
}

#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    sender: mpsc::UnboundedSender<SchedulerMessage>,
}

impl SchedulerHandle {
    pub fn new(sender: mpsc::UnboundedSender<SchedulerMessage>) -> SchedulerHandle {
        SchedulerHandle { sender }
    }

    pub fn send(&self, message: SchedulerMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

/// Activation hook installed at boot; the cluster-activation service
/// provides the implementation that knows how to interpret computation
/// bodies. Wiring is two-phase: the runtime creates the task manager first,
/// activates the scheduler with it, then injects the scheduler reference
/// back into the task manager, so neither owns the other's lifetime.
#[async_trait]
pub trait SchedulerFactory: Send + Sync {
    async fn activate(
        &self,
        process_id: ProcessId,
        task_manager: TaskManagerHandle,
        completion: CompletionSink,
    ) -> Result<SchedulerHandle, ActivationError>;
}

/// Placeholder used by nodes without a computation engine; every admission
/// fails with an activation error.
pub struct SchedulerFactoryDisabled;

#[async_trait]
impl SchedulerFactory for SchedulerFactoryDisabled {
    async fn activate(
        &self,
        process_id: ProcessId,
        _task_manager: TaskManagerHandle,
        _completion: CompletionSink,
    ) -> Result<SchedulerHandle, ActivationError> {
        Err(ActivationError::FailedToActivate {
            process_id,
            details: "no computation engine is registered on this node".to_string(),
        })
    }
}
