//! Capability traits over the container runtime.
//!
//! The orchestrator never talks to an engine directly. It opens a fresh
//! [`RuntimeClient`] through a [`RuntimeConnector`] for every operation and
//! re-queries runtime state instead of caching it.

pub mod docker;

use async_trait::async_trait;

use crate::error::Result;

/// The runtime's notion of a created container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    /// Image reference the container was created from. A record whose image
    /// disagrees with the currently desired reference is stale and must be
    /// destroyed before a task may run.
    pub image_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created but not yet started.
    Created,
    Running,
    Stopped,
}

/// The runtime's notion of a process group for a container. At most one per
/// container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub pid: u32,
    pub status: TaskStatus,
}

impl TaskRecord {
    /// Network namespace path of the task's init process.
    #[must_use]
    pub fn netns(&self) -> String {
        format!("/proc/{}/ns/net", self.pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskExit {
    pub code: i64,
}

/// One short-lived connection to the container engine.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn load_container(&self, id: &str) -> Result<Option<ContainerRecord>>;

    async fn image_present(&self, reference: &str) -> Result<bool>;

    async fn pull_image(&self, reference: &str) -> Result<()>;

    async fn create_container(&self, id: &str, reference: &str) -> Result<ContainerRecord>;

    /// Deletes the container together with its snapshot.
    async fn delete_container(&self, id: &str) -> Result<()>;

    async fn load_task(&self, id: &str) -> Result<Option<TaskRecord>>;

    async fn create_task(&self, id: &str) -> Result<TaskRecord>;

    async fn start_task(&self, id: &str) -> Result<()>;

    /// Requests graceful termination (SIGTERM).
    async fn kill_task(&self, id: &str) -> Result<()>;

    /// Resolves once the task has exited.
    async fn wait_task(&self, id: &str) -> Result<TaskExit>;

    async fn delete_task(&self, id: &str) -> Result<()>;

    async fn task_status(&self, id: &str) -> Result<TaskStatus>;

    /// Opaque metrics snapshot for the task. Not interpreted here.
    async fn task_metrics(&self, id: &str) -> Result<serde_json::Value>;
}

/// Opens a fresh engine connection per orchestrator call. No pooling.
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RuntimeClient>>;
}
