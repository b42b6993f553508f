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

//! Wire protocol of the runtime. Every message is a closed tagged union
//! carried in an envelope with a correlation id and a reply address; live
//! actor references never appear here, only node descriptors and ids.

use chrono::{DateTime, Utc};
use mbrace_common::model::{
    AssemblyId, AssemblyImage, ClientRequestId, DeploymentId, NodeId, NodeInfo, Permissions,
    ProcessId, ProcessImage, TaskHeader, TaskId, TaskPayload,
};
use mbrace_common::serialization;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-facing operations of the process manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcessManagerOp {
    CreateDynamicProcess {
        request_id: ClientRequestId,
        image: ProcessImage,
    },
    GetProcessInfo {
        process_id: ProcessId,
    },
    GetAllProcessInfo,
    ClearProcessInfo {
        process_id: ProcessId,
    },
    ClearAllProcessInfo,
    KillProcess {
        process_id: ProcessId,
    },
    RequestDependencies {
        ids: Vec<AssemblyId>,
    },
    LoadAssemblies {
        images: Vec<AssemblyImage>,
    },
    GetAssemblyLoadInfo {
        ids: Vec<AssemblyId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub correlation_id: Uuid,
    pub reply_to: String,
    pub op: ProcessManagerOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyBody {
    Value(Vec<u8>),
    Exception(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub correlation_id: Uuid,
    pub body: ReplyBody,
}

impl ReplyEnvelope {
    pub fn value<T: Serialize>(correlation_id: Uuid, value: &T) -> Result<ReplyEnvelope, String> {
        Ok(ReplyEnvelope {
            correlation_id,
            body: ReplyBody::Value(serialization::serialize(value)?),
        })
    }

    pub fn exception(correlation_id: Uuid, details: impl Into<String>) -> ReplyEnvelope {
        ReplyEnvelope {
            correlation_id,
            body: ReplyBody::Exception(details.into()),
        }
    }
}

/// Node administration operations, consumed by the CLI/admin tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterOp {
    Ping,
    GetNodeDeploymentInfo,
    GetNodePerformanceCounters,
    Attach { node: NodeInfo },
    Detach { node_id: NodeId },
    SetNodePermissions { node_id: NodeId, permissions: Permissions },
    GetAllNodes,
    GetMasterAndAlts,
    GetDeploymentId,
    GetLogDump,
    Shutdown,
    ShutdownSync,
    MasterBoot { configuration: ClusterBootImage },
}

/// Wire form of a master-boot configuration; capability handles for the
/// listed nodes are established separately by the communication layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterBootImage {
    pub nodes: Vec<NodeInfo>,
    pub replication_factor: usize,
    pub failover_factor: usize,
}

/// Messages posted to executor nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerOp {
    ExecuteTask { payload: TaskPayload },
    CancelTasks { task_ids: Vec<TaskId> },
}

/// A worker-produced task result on its way back to the owning task manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultEnvelope {
    pub header: TaskHeader,
    pub result: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDeploymentInfo {
    pub deployment_id: DeploymentId,
    pub master: Option<NodeInfo>,
    pub nodes: Vec<NodeInfo>,
    pub booted_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePerformanceCounters {
    pub cpu_usage: f32,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub process_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbrace_common::model::{NodeType, ProcessInfo, ProcessResult, ProcessState};
    use mbrace_common::serialization::{deserialize, serialize};
    use test_r::test;

    fn roundtrip<T: Serialize + serde::de::DeserializeOwned + PartialEq + std::fmt::Debug>(
        value: &T,
    ) {
        let bytes = serialize(value).unwrap();
        let decoded: T = deserialize(&bytes).unwrap();
        assert_eq!(*value, decoded);
    }

    fn sample_image() -> ProcessImage {
        ProcessImage {
            name: "wordcount".to_string(),
            computation: vec![1, 2, 3, 4],
            return_type: vec![9, 9],
            type_name: "int".to_string(),
            client_id: "client-1".to_string(),
            dependencies: vec![AssemblyId::new_v4(), AssemblyId::new_v4()],
        }
    }

    #[test]
    fn process_manager_ops_roundtrip() {
        let ops = vec![
            ProcessManagerOp::CreateDynamicProcess {
                request_id: ClientRequestId::new_v4(),
                image: sample_image(),
            },
            ProcessManagerOp::GetProcessInfo {
                process_id: ProcessId::new_v4(),
            },
            ProcessManagerOp::GetAllProcessInfo,
            ProcessManagerOp::ClearProcessInfo {
                process_id: ProcessId::new_v4(),
            },
            ProcessManagerOp::ClearAllProcessInfo,
            ProcessManagerOp::KillProcess {
                process_id: ProcessId::new_v4(),
            },
            ProcessManagerOp::RequestDependencies {
                ids: vec![AssemblyId::new_v4()],
            },
            ProcessManagerOp::LoadAssemblies {
                images: vec![AssemblyImage {
                    id: AssemblyId::new_v4(),
                    name: "core".to_string(),
                    image: vec![0, 1],
                }],
            },
            ProcessManagerOp::GetAssemblyLoadInfo {
                ids: vec![AssemblyId::new_v4()],
            },
        ];
        for op in ops {
            roundtrip(&RequestEnvelope {
                correlation_id: Uuid::new_v4(),
                reply_to: "client-node:9090".to_string(),
                op,
            });
        }
    }

    #[test]
    fn reply_envelope_roundtrip() {
        let reply = ReplyEnvelope::value(Uuid::new_v4(), &42u64).unwrap();
        roundtrip(&reply);
        match reply.body {
            ReplyBody::Value(bytes) => {
                let value: u64 = deserialize(&bytes).unwrap();
                assert_eq!(value, 42);
            }
            ReplyBody::Exception(_) => panic!("expected a value"),
        }

        roundtrip(&ReplyEnvelope::exception(Uuid::new_v4(), "boom"));
    }

    #[test]
    fn cluster_ops_roundtrip() {
        let node = NodeInfo {
            node_id: NodeId::new_v4(),
            address: "10.0.0.2:8555".to_string(),
            node_type: NodeType::Slave,
            permissions: Permissions::SLAVE,
        };
        let ops = vec![
            ClusterOp::Ping,
            ClusterOp::GetNodeDeploymentInfo,
            ClusterOp::GetNodePerformanceCounters,
            ClusterOp::Attach { node: node.clone() },
            ClusterOp::Detach {
                node_id: node.node_id,
            },
            ClusterOp::SetNodePermissions {
                node_id: node.node_id,
                permissions: Permissions::all(),
            },
            ClusterOp::GetAllNodes,
            ClusterOp::GetMasterAndAlts,
            ClusterOp::GetDeploymentId,
            ClusterOp::GetLogDump,
            ClusterOp::Shutdown,
            ClusterOp::ShutdownSync,
            ClusterOp::MasterBoot {
                configuration: ClusterBootImage {
                    nodes: vec![node],
                    replication_factor: 2,
                    failover_factor: 1,
                },
            },
        ];
        for op in ops {
            roundtrip(&op);
        }
    }

    #[test]
    fn worker_ops_roundtrip() {
        let payload = TaskPayload {
            header: TaskHeader {
                process_id: ProcessId::new_v4(),
                task_id: TaskId::new_v4(),
            },
            body: vec![7; 32],
            dependencies: vec![AssemblyId::new_v4()],
        };
        roundtrip(&WorkerOp::ExecuteTask {
            payload: payload.clone(),
        });
        roundtrip(&WorkerOp::CancelTasks {
            task_ids: vec![TaskId::new_v4(), TaskId::new_v4()],
        });
        roundtrip(&TaskResultEnvelope {
            header: payload.header,
            result: vec![1, 2, 3],
        });
    }

    #[test]
    fn process_info_roundtrip() {
        let info = ProcessInfo {
            process_id: ProcessId::new_v4(),
            request_id: ClientRequestId::new_v4(),
            name: "pi-estimate".to_string(),
            type_name: "float".to_string(),
            state: ProcessState::Completed,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            worker_count: 4,
            task_count: 0,
            result: Some(ProcessResult::Success(vec![3, 1, 4])),
        };
        roundtrip(&info);
    }

    #[test]
    fn deployment_info_roundtrip() {
        let info = NodeDeploymentInfo {
            deployment_id: DeploymentId::new_v4(),
            master: None,
            nodes: vec![],
            booted_at: Some(Utc::now()),
            failure: Some("replication degraded".to_string()),
        };
        roundtrip(&info);
    }
}
