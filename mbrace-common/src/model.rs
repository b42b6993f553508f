use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use strum_macros::EnumIter;

#[macro_export]
macro_rules! newtype_uuid {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new_v4() -> $name {
                $name(uuid::Uuid::new_v4())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = uuid::Uuid::parse_str(s)
                    .map_err(|err| format!("Invalid {}: {err}", stringify!($name)))?;
                Ok($name(uuid))
            }
        }

        impl TryFrom<&str> for $name {
            type Error = String;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

newtype_uuid!(ProcessId);
newtype_uuid!(TaskId);
newtype_uuid!(NodeId);
newtype_uuid!(ClientRequestId);
newtype_uuid!(DeploymentId);
newtype_uuid!(AssemblyId);

/// A worker is an executor node holding `Permissions::SLAVE`.
pub type WorkerId = NodeId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permissions: u8 {
        const SLAVE = 1;
        const MASTER = 2;
    }
}

impl Permissions {
    pub fn can_execute_tasks(&self) -> bool {
        self.contains(Permissions::SLAVE)
    }

    pub fn can_host_managers(&self) -> bool {
        self.contains(Permissions::MASTER)
    }
}

impl Display for Permissions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "None")
        } else if self.is_all() {
            write!(f, "All")
        } else if self.contains(Permissions::SLAVE) {
            write!(f, "Slave")
        } else {
            write!(f, "Master")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter)]
pub enum NodeType {
    Master,
    Alt,
    Slave,
    Idle,
}

impl Display for NodeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Master => write!(f, "Master"),
            NodeType::Alt => write!(f, "Alt"),
            NodeType::Slave => write!(f, "Slave"),
            NodeType::Idle => write!(f, "Idle"),
        }
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Master" => Ok(NodeType::Master),
            "Alt" => Ok(NodeType::Alt),
            "Slave" => Ok(NodeType::Slave),
            "Idle" => Ok(NodeType::Idle),
            _ => Err(format!("Unknown node type: {s}")),
        }
    }
}

/// Descriptor of a cluster node as it appears on the wire. Live connection
/// handles are attached separately and never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub address: String,
    pub node_type: NodeType,
    pub permissions: Permissions,
}

/// Process lifecycle. Transitions are monotone: once a terminal state is
/// reached no further transition is accepted. `Recovering` is a transient
/// overlay entered from `Running` while failed-worker tasks are reissued; it
/// carries the number of reissues still outstanding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Initialized,
    Created,
    Running,
    Recovering(u32),
    Completed,
    Failed,
    Killed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed | ProcessState::Killed
        )
    }

    pub fn can_transition(&self, next: &ProcessState) -> bool {
        use ProcessState::*;
        match (self, next) {
            (Initialized, Created) => true,
            (Initialized, Failed | Killed) => true,
            (Created, Running) => true,
            (Created, Failed | Killed) => true,
            (Running, Completed | Failed | Killed) => true,
            (Running, Recovering(_)) => true,
            (Recovering(_), Recovering(_) | Running) => true,
            (Recovering(_), Completed | Failed | Killed) => true,
            _ => false,
        }
    }
}

impl Display for ProcessState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Initialized => write!(f, "Initialized"),
            ProcessState::Created => write!(f, "Created"),
            ProcessState::Running => write!(f, "Running"),
            ProcessState::Recovering(n) => write!(f, "Recovering({n})"),
            ProcessState::Completed => write!(f, "Completed"),
            ProcessState::Failed => write!(f, "Failed"),
            ProcessState::Killed => write!(f, "Killed"),
        }
    }
}

/// Terminal outcome of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessResult {
    InitError(String),
    Fault(String),
    Success(Vec<u8>),
    Killed,
}

impl ProcessResult {
    /// The process state this outcome settles the record into.
    pub fn terminal_state(&self) -> ProcessState {
        match self {
            ProcessResult::Success(_) => ProcessState::Completed,
            ProcessResult::InitError(_) | ProcessResult::Fault(_) => ProcessState::Failed,
            ProcessResult::Killed => ProcessState::Killed,
        }
    }
}

/// Submission image of a user computation. The computation blob and the
/// return-type descriptor are opaque to the core; worker nodes and the
/// per-process scheduler know how to interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessImage {
    pub name: String,
    pub computation: Vec<u8>,
    pub return_type: Vec<u8>,
    pub type_name: String,
    pub client_id: String,
    pub dependencies: Vec<AssemblyId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub process_id: ProcessId,
    pub request_id: ClientRequestId,
    pub name: String,
    pub type_name: String,
    pub return_type: Vec<u8>,
    pub client_id: String,
    pub dependencies: Vec<AssemblyId>,
    pub state: ProcessState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub result: Option<ProcessResult>,
}

impl ProcessRecord {
    pub fn info(&self, worker_count: usize, task_count: usize) -> ProcessInfo {
        ProcessInfo {
            process_id: self.process_id,
            request_id: self.request_id,
            name: self.name.clone(),
            type_name: self.type_name.clone(),
            state: self.state.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            worker_count,
            task_count,
            result: self.result.clone(),
        }
    }
}

/// Client-facing view of a process record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub process_id: ProcessId,
    pub request_id: ClientRequestId,
    pub name: String,
    pub type_name: String,
    pub state: ProcessState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub worker_count: usize,
    pub task_count: usize,
    pub result: Option<ProcessResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHeader {
    pub process_id: ProcessId,
    pub task_id: TaskId,
}

impl Display for TaskHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.process_id, self.task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub header: TaskHeader,
    pub body: Vec<u8>,
    pub dependencies: Vec<AssemblyId>,
}

/// One outstanding task in the replicated log. Stores the id of the worker
/// currently responsible for the task; the live connection is resolved
/// through the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub task_id: TaskId,
    pub parent: Option<TaskId>,
    pub worker_id: WorkerId,
    pub payload: TaskPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyImage {
    pub id: AssemblyId,
    pub name: String,
    pub image: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssemblyLoadInfo {
    Loaded(AssemblyId),
    LoadFault(AssemblyId, String),
    NotLoaded(AssemblyId),
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;
    use test_r::test;

    #[test]
    fn node_type_to_from() {
        for node_type in NodeType::iter() {
            let as_str = node_type.to_string();
            let deserialized = NodeType::from_str(&as_str).unwrap();
            assert_eq!(node_type, deserialized);
        }
    }

    #[test]
    fn process_id_to_from() {
        let id = ProcessId::new_v4();
        let parsed = ProcessId::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(ProcessId::from_str("not-a-uuid").is_err());
    }

    #[test]
    fn permission_bits() {
        assert_eq!(Permissions::empty().bits(), 0);
        assert_eq!(Permissions::SLAVE.bits(), 1);
        assert_eq!(Permissions::MASTER.bits(), 2);
        assert_eq!(Permissions::all().bits(), 3);
        assert!(!Permissions::empty().can_execute_tasks());
        assert!(Permissions::all().can_execute_tasks());
        assert!(!Permissions::SLAVE.can_host_managers());
    }

    #[test]
    fn process_state_is_monotone() {
        use ProcessState::*;

        assert!(Initialized.can_transition(&Created));
        assert!(Created.can_transition(&Running));
        assert!(Running.can_transition(&Recovering(3)));
        assert!(Recovering(3).can_transition(&Running));
        assert!(Recovering(1).can_transition(&Killed));

        for terminal in [Completed, Failed, Killed] {
            assert!(terminal.is_terminal());
            for next in [
                Initialized,
                Created,
                Running,
                Recovering(1),
                Completed,
                Failed,
                Killed,
            ] {
                assert!(!terminal.can_transition(&next));
            }
        }

        assert!(!Running.can_transition(&Created));
        assert!(!Initialized.can_transition(&Running));
    }

    #[test]
    fn process_result_terminal_state() {
        assert_eq!(
            ProcessResult::Success(vec![1]).terminal_state(),
            ProcessState::Completed
        );
        assert_eq!(
            ProcessResult::Fault("boom".to_string()).terminal_state(),
            ProcessState::Failed
        );
        assert_eq!(ProcessResult::Killed.terminal_state(), ProcessState::Killed);
    }
}
