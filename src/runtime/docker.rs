//! Docker engine backend for the runtime capability traits.
//!
//! Docker has no created-but-not-running process the way containerd tasks
//! do, so the task lifecycle is mapped onto container state: `create_task`
//! starts the container and immediately pauses it, which yields a pid (and
//! with it a network namespace path) before the workload runs;
//! `start_task` unpauses. A paused container therefore reads as a task in
//! the `Created` state, and an exited container reads as no task at all.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::secret::{ContainerStateStatusEnum, HostConfig};
use futures_util::stream::StreamExt;
use tracing::debug;

use super::{ContainerRecord, RuntimeClient, RuntimeConnector, TaskExit, TaskRecord, TaskStatus};
use crate::error::{Error, Result};

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connects to the Docker engine over its unix socket, once per call.
#[derive(Debug, Clone)]
pub struct DockerConnector {
    socket: String,
}

impl DockerConnector {
    #[must_use]
    pub fn new(socket: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
        }
    }
}

#[async_trait]
impl RuntimeConnector for DockerConnector {
    async fn connect(&self) -> Result<Box<dyn RuntimeClient>> {
        let client = Docker::connect_with_unix(
            &self.socket,
            CONNECT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;

        // The constructor is lazy; surface connection failures here.
        client
            .ping()
            .await
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;

        Ok(Box::new(DockerRuntime { client }))
    }
}

pub struct DockerRuntime {
    client: Docker,
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_not_modified(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn runtime_err(err: DockerError) -> Error {
    Error::Runtime(err.to_string())
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn load_container(&self, id: &str) -> Result<Option<ContainerRecord>> {
        match self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let image_ref = inspect
                    .config
                    .and_then(|config| config.image)
                    .unwrap_or_default();
                Ok(Some(ContainerRecord {
                    id: id.to_owned(),
                    image_ref,
                }))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn image_present(&self, reference: &str) -> Result<bool> {
        match self.client.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: reference.to_owned(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(reference, status, "pull progress");
                    }
                }
                Err(e) => return Err(Error::ImagePull(e.to_string())),
            }
        }

        Ok(())
    }

    async fn create_container(&self, id: &str, reference: &str) -> Result<ContainerRecord> {
        let options = CreateContainerOptions {
            name: id.to_owned(),
            ..Default::default()
        };

        // Networking is provisioned out of band against the task's netns,
        // so the engine's own networking is disabled.
        let host_config = HostConfig {
            network_mode: Some("none".to_owned()),
            cap_add: Some(vec!["NET_RAW".to_owned()]),
            ..Default::default()
        };

        let config = Config {
            image: Some(reference.to_owned()),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.client
            .create_container(Some(options), config)
            .await
            .map_err(runtime_err)?;

        Ok(ContainerRecord {
            id: id.to_owned(),
            image_ref: reference.to_owned(),
        })
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn load_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let inspect = match self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(runtime_err(e)),
        };

        let Some(state) = inspect.state else {
            return Ok(None);
        };

        let pid = state.pid.unwrap_or_default() as u32;
        match state.status {
            Some(ContainerStateStatusEnum::RUNNING) => Ok(Some(TaskRecord {
                pid,
                status: TaskStatus::Running,
            })),
            Some(ContainerStateStatusEnum::PAUSED) => Ok(Some(TaskRecord {
                pid,
                status: TaskStatus::Created,
            })),
            _ => Ok(None),
        }
    }

    async fn create_task(&self, id: &str) -> Result<TaskRecord> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_err)?;
        self.client
            .pause_container(id)
            .await
            .map_err(runtime_err)?;

        let inspect = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(runtime_err)?;

        let pid = inspect
            .state
            .and_then(|state| state.pid)
            .unwrap_or_default() as u32;

        Ok(TaskRecord {
            pid,
            status: TaskStatus::Created,
        })
    }

    async fn start_task(&self, id: &str) -> Result<()> {
        self.client.unpause_container(id).await.map_err(runtime_err)
    }

    async fn kill_task(&self, id: &str) -> Result<()> {
        let options = KillContainerOptions { signal: "SIGTERM" };
        self.client
            .kill_container(id, Some(options))
            .await
            .map_err(runtime_err)
    }

    async fn wait_task(&self, id: &str) -> Result<TaskExit> {
        let mut stream = self
            .client
            .wait_container(id, None::<WaitContainerOptions<String>>);

        match stream.next().await {
            Some(Ok(response)) => Ok(TaskExit {
                code: response.status_code,
            }),
            // bollard reports a non-zero exit as an error item.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                Ok(TaskExit { code })
            }
            Some(Err(e)) => Err(runtime_err(e)),
            None => Err(Error::Runtime(format!(
                "wait stream for {id} ended without a status"
            ))),
        }
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let options = StopContainerOptions { t: 0 };
        match self.client.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) || is_not_found(&e) => Ok(()),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn task_status(&self, id: &str) -> Result<TaskStatus> {
        match self.load_task(id).await? {
            Some(task) => Ok(task.status),
            None => Ok(TaskStatus::Stopped),
        }
    }

    async fn task_metrics(&self, id: &str) -> Result<serde_json::Value> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = self.client.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => {
                serde_json::to_value(&stats).map_err(|e| Error::Runtime(e.to_string()))
            }
            Some(Err(e)) => Err(runtime_err(e)),
            None => Err(Error::Runtime(format!("no stats reported for {id}"))),
        }
    }
}
