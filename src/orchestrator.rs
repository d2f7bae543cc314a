//! Reconciliation of a workload against the container runtime.
//!
//! Every operation opens a fresh runtime connection and re-queries state;
//! nothing about containers or tasks is cached between calls. Concurrent
//! calls on the same identity are not serialized: reconciliation converges,
//! so a racing caller at worst sees a transient error that the next call
//! corrects.

use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::EndpointDirectory;
use crate::error::{Error, Result};
use crate::events::CreationListener;
use crate::images::ImageResolver;
use crate::runtime::{ContainerRecord, RuntimeClient, RuntimeConnector, TaskExit, TaskStatus};

/// Runtime metrics snapshot for a deployed workload. The payload is passed
/// through from the runtime unmodified.
#[derive(Debug, Serialize)]
pub struct InfoReport {
    pub id: String,
    pub timestamp: SystemTime,
    pub metrics: serde_json::Value,
}

pub struct Orchestrator {
    connector: Arc<dyn RuntimeConnector>,
    images: Arc<dyn ImageResolver>,
    listeners: Vec<Arc<dyn CreationListener>>,
    /// Present in the single-process topology. In the split topology the
    /// directory lives in the network service and records simply go stale
    /// on undeploy, to be overwritten by the next deploy.
    directory: Option<Arc<EndpointDirectory>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        connector: Arc<dyn RuntimeConnector>,
        images: Arc<dyn ImageResolver>,
        listeners: Vec<Arc<dyn CreationListener>>,
        directory: Option<Arc<EndpointDirectory>>,
    ) -> Self {
        Self {
            connector,
            images,
            listeners,
            directory,
        }
    }

    /// Drives the runtime to "container exists with the desired image and
    /// its task is running". Idempotent on an already-running workload.
    pub async fn deploy(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let image_ref = self.images.resolve(id)?;
        let client = self.connector.connect().await?;

        info!(id, image = %image_ref, "deploying");
        let container = self
            .ensure_container(client.as_ref(), id, &image_ref, cancel)
            .await?;
        self.ensure_task(client.as_ref(), &container).await?;
        info!(id, "deploy done");

        Ok(())
    }

    /// Leaves the container with no task. Succeeds trivially when no task
    /// exists.
    pub async fn undeploy(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let client = self.connector.connect().await?;

        if client.load_container(id).await?.is_none() {
            return Err(Error::NotFound(id.to_owned()));
        }

        if let Some(directory) = &self.directory {
            directory.delete(id);
            debug!(id, "endpoint record removed");
        }

        self.ensure_task_delete(client.as_ref(), id, cancel).await
    }

    pub async fn info(&self, id: &str) -> Result<InfoReport> {
        let client = self.connector.connect().await?;

        if client.load_container(id).await?.is_none() {
            return Err(Error::NotFound(id.to_owned()));
        }
        if client.load_task(id).await?.is_none() {
            return Err(Error::NotFound(id.to_owned()));
        }

        let metrics = client.task_metrics(id).await?;
        Ok(InfoReport {
            id: id.to_owned(),
            timestamp: SystemTime::now(),
            metrics,
        })
    }

    async fn ensure_container(
        &self,
        client: &dyn RuntimeClient,
        id: &str,
        image_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerRecord> {
        match client.load_container(id).await? {
            None => self.create_container(client, id, image_ref).await,
            Some(existing) if existing.image_ref != image_ref => {
                info!(
                    id,
                    old = %existing.image_ref,
                    new = %image_ref,
                    "image changed, recreating container"
                );
                self.delete_container(client, id, cancel).await?;
                self.create_container(client, id, image_ref).await
            }
            Some(existing) => Ok(existing),
        }
    }

    async fn create_container(
        &self,
        client: &dyn RuntimeClient,
        id: &str,
        image_ref: &str,
    ) -> Result<ContainerRecord> {
        if !client.image_present(image_ref).await? {
            info!(image = %image_ref, "pulling image");
            client.pull_image(image_ref).await?;
        }

        info!(id, "creating container");
        client.create_container(id, image_ref).await
    }

    /// Teardown must fully complete before a caller may recreate; the task
    /// goes first, then the container with its snapshot.
    async fn delete_container(
        &self,
        client: &dyn RuntimeClient,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_task_delete(client, id, cancel).await?;
        client.delete_container(id).await
    }

    async fn ensure_task(&self, client: &dyn RuntimeClient, container: &ContainerRecord) -> Result<()> {
        if client.load_task(&container.id).await?.is_some() {
            debug!(id = %container.id, "task already exists");
            return Ok(());
        }

        info!(id = %container.id, "creating task");
        let task = client.create_task(&container.id).await?;
        let netns = task.netns();

        // Registration happens before start, so a router lookup sees either
        // no record or a complete one. A listener failure rolls the task
        // back.
        for listener in &self.listeners {
            if let Err(e) = listener.created(&container.id, &netns).await {
                warn!(id = %container.id, error = %e, "creation listener failed, rolling back task");
                self.rollback_task(client, &container.id).await;
                return Err(e);
            }
        }

        info!(id = %container.id, "starting task");
        if let Err(e) = client.start_task(&container.id).await {
            // The endpoint record registered above is knowingly left behind;
            // a redeploy overwrites it.
            self.rollback_task(client, &container.id).await;
            return Err(e);
        }

        Ok(())
    }

    async fn rollback_task(&self, client: &dyn RuntimeClient, id: &str) {
        if let Err(e) = client.delete_task(id).await {
            warn!(id, error = %e, "failed to delete task during rollback");
        }
    }

    async fn ensure_task_delete(
        &self,
        client: &dyn RuntimeClient,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(task) = client.load_task(id).await? else {
            debug!(id, "no task to delete");
            return Ok(());
        };

        if task.status == TaskStatus::Stopped {
            return client.delete_task(id).await;
        }

        let exit = self.stop_wait(client, id, cancel).await?;
        if exit.code != 0 {
            info!(id, code = exit.code, "task exited with non-zero status");
        }

        client.delete_task(id).await
    }

    /// The one true race in the design: the exit notification against the
    /// caller's cancellation, first to resolve wins. On cancellation the
    /// task is left in an unknown running/exiting state.
    async fn stop_wait(
        &self,
        client: &dyn RuntimeClient,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskExit> {
        let wait = client.wait_task(id);
        tokio::pin!(wait);

        client.kill_task(id).await?;

        tokio::select! {
            exit = &mut wait => exit,
            () = cancel.cancelled() => Err(Error::ShutdownTimeout(id.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LocalProvisioner;
    use crate::network::{InterfaceReport, NetworkProvisioner, NetworkSetupMechanism};
    use crate::runtime::TaskRecord;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};
    use tokio::sync::watch;

    const NETNS_BASE: u32 = 4240;

    struct FakeTask {
        pid: u32,
        status: watch::Sender<TaskStatus>,
    }

    #[derive(Default)]
    struct FakeState {
        local_images: HashSet<String>,
        containers: HashMap<String, String>,
        tasks: HashMap<String, FakeTask>,
        create_container_calls: usize,
        create_task_calls: usize,
        fail_pull: bool,
        fail_start: bool,
        /// How long after SIGTERM the task exits. `None` means it never does.
        exit_after: Option<Duration>,
        exit_code: i64,
        log: Vec<&'static str>,
    }

    #[derive(Clone, Default)]
    struct FakeRuntime(Arc<Mutex<FakeState>>);

    impl FakeRuntime {
        fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
            self.0.lock().unwrap()
        }
    }

    #[async_trait]
    impl RuntimeClient for FakeRuntime {
        async fn load_container(&self, id: &str) -> Result<Option<ContainerRecord>> {
            Ok(self.state().containers.get(id).map(|image_ref| ContainerRecord {
                id: id.to_owned(),
                image_ref: image_ref.clone(),
            }))
        }

        async fn image_present(&self, reference: &str) -> Result<bool> {
            Ok(self.state().local_images.contains(reference))
        }

        async fn pull_image(&self, reference: &str) -> Result<()> {
            let mut state = self.state();
            if state.fail_pull {
                return Err(Error::ImagePull(format!("cannot resolve {reference}")));
            }
            state.local_images.insert(reference.to_owned());
            Ok(())
        }

        async fn create_container(&self, id: &str, reference: &str) -> Result<ContainerRecord> {
            let mut state = self.state();
            state.create_container_calls += 1;
            state.containers.insert(id.to_owned(), reference.to_owned());
            Ok(ContainerRecord {
                id: id.to_owned(),
                image_ref: reference.to_owned(),
            })
        }

        async fn delete_container(&self, id: &str) -> Result<()> {
            let mut state = self.state();
            if state.tasks.contains_key(id) {
                return Err(Error::Runtime(format!("container {id} still has a task")));
            }
            state.containers.remove(id);
            Ok(())
        }

        async fn load_task(&self, id: &str) -> Result<Option<TaskRecord>> {
            Ok(self.state().tasks.get(id).map(|task| TaskRecord {
                pid: task.pid,
                status: *task.status.borrow(),
            }))
        }

        async fn create_task(&self, id: &str) -> Result<TaskRecord> {
            let mut state = self.state();
            state.create_task_calls += 1;
            state.log.push("create_task");
            let pid = NETNS_BASE + state.create_task_calls as u32;
            let (tx, _) = watch::channel(TaskStatus::Created);
            state.tasks.insert(id.to_owned(), FakeTask { pid, status: tx });
            Ok(TaskRecord {
                pid,
                status: TaskStatus::Created,
            })
        }

        async fn start_task(&self, id: &str) -> Result<()> {
            let mut state = self.state();
            if state.fail_start {
                return Err(Error::Runtime(format!("cannot start {id}")));
            }
            state.log.push("start_task");
            if let Some(task) = state.tasks.get(id) {
                task.status.send_replace(TaskStatus::Running);
            }
            Ok(())
        }

        async fn kill_task(&self, id: &str) -> Result<()> {
            let (exit_after, status) = {
                let state = self.state();
                (
                    state.exit_after,
                    state.tasks.get(id).map(|task| task.status.clone()),
                )
            };

            let Some(status) = status else {
                return Err(Error::Runtime(format!("no task for {id}")));
            };

            if let Some(delay) = exit_after {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    status.send_replace(TaskStatus::Stopped);
                });
            }

            Ok(())
        }

        async fn wait_task(&self, id: &str) -> Result<TaskExit> {
            let mut rx = {
                let state = self.state();
                let task = state
                    .tasks
                    .get(id)
                    .ok_or_else(|| Error::Runtime(format!("no task for {id}")))?;
                task.status.subscribe()
            };

            loop {
                if *rx.borrow_and_update() == TaskStatus::Stopped {
                    return Ok(TaskExit {
                        code: self.state().exit_code,
                    });
                }
                rx.changed()
                    .await
                    .map_err(|_| Error::Runtime("task dropped".into()))?;
            }
        }

        async fn delete_task(&self, id: &str) -> Result<()> {
            let mut state = self.state();
            state.log.push("delete_task");
            state.tasks.remove(id);
            Ok(())
        }

        async fn task_status(&self, id: &str) -> Result<TaskStatus> {
            Ok(self
                .state()
                .tasks
                .get(id)
                .map_or(TaskStatus::Stopped, |task| *task.status.borrow()))
        }

        async fn task_metrics(&self, id: &str) -> Result<serde_json::Value> {
            if !self.state().tasks.contains_key(id) {
                return Err(Error::Runtime(format!("no task for {id}")));
            }
            Ok(serde_json::json!({ "cpu_nanos": 1_000_000 }))
        }
    }

    struct FakeConnector {
        runtime: FakeRuntime,
        fail: AtomicBool,
    }

    #[async_trait]
    impl RuntimeConnector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn RuntimeClient>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::RuntimeUnavailable("connection refused".into()));
            }
            Ok(Box::new(self.runtime.clone()))
        }
    }

    /// Resolves every id to one mutable reference, for image-change tests.
    struct SwappableResolver {
        reference: Mutex<Option<String>>,
    }

    impl ImageResolver for SwappableResolver {
        fn resolve(&self, id: &str) -> Result<String> {
            self.reference
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::NotFound(id.to_owned()))
        }
    }

    /// Reports fixed interfaces and records that provisioning ran, so tests
    /// can assert ordering against the runtime log.
    struct RecordingMechanism {
        state: Arc<Mutex<FakeState>>,
        addresses: Vec<std::net::IpAddr>,
    }

    #[async_trait]
    impl NetworkSetupMechanism for RecordingMechanism {
        async fn setup(&self, _id: &str, netns: &str) -> Result<Vec<InterfaceReport>> {
            self.state.lock().unwrap().log.push("provision");
            Ok(vec![InterfaceReport {
                name: "eth0".into(),
                sandbox: netns.to_owned(),
                addresses: self.addresses.clone(),
            }])
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        runtime: FakeRuntime,
        directory: Arc<EndpointDirectory>,
        resolver: Arc<SwappableResolver>,
    }

    fn fixture_with_addresses(addresses: Vec<std::net::IpAddr>) -> Fixture {
        let runtime = FakeRuntime::default();
        let directory = Arc::new(EndpointDirectory::new());
        let resolver = Arc::new(SwappableResolver {
            reference: Mutex::new(Some("docker.io/library/nginx:1.27".to_owned())),
        });

        let mechanism = RecordingMechanism {
            state: runtime.0.clone(),
            addresses,
        };
        let listener = LocalProvisioner::new(
            NetworkProvisioner::new(Arc::new(mechanism)),
            directory.clone(),
            8080,
        );

        let orchestrator = Orchestrator::new(
            Arc::new(FakeConnector {
                runtime: runtime.clone(),
                fail: AtomicBool::new(false),
            }),
            resolver.clone(),
            vec![Arc::new(listener)],
            Some(directory.clone()),
        );

        Fixture {
            orchestrator,
            runtime,
            directory,
            resolver,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_addresses(vec!["10.4.0.17".parse().unwrap()])
    }

    #[tokio::test]
    async fn deploy_creates_container_and_registers_endpoint() {
        let f = fixture();
        let cancel = CancellationToken::new();

        f.orchestrator.deploy("web", &cancel).await.unwrap();

        let state = f.runtime.state();
        assert_eq!(state.create_container_calls, 1);
        assert_eq!(state.create_task_calls, 1);
        assert_eq!(
            *state.tasks["web"].status.borrow(),
            TaskStatus::Running
        );
        drop(state);

        // read-your-write: the record written during this deploy is visible
        assert_eq!(
            f.directory.load("web").unwrap(),
            "http://10.4.0.17:8080/".parse::<axum::http::Uri>().unwrap()
        );
    }

    #[tokio::test]
    async fn deploy_is_idempotent() {
        let f = fixture();
        let cancel = CancellationToken::new();

        f.orchestrator.deploy("web", &cancel).await.unwrap();
        f.orchestrator.deploy("web", &cancel).await.unwrap();

        let state = f.runtime.state();
        assert_eq!(state.create_container_calls, 1);
        assert_eq!(state.create_task_calls, 1);
    }

    #[tokio::test]
    async fn endpoint_registration_happens_before_start() {
        let f = fixture();
        f.orchestrator
            .deploy("web", &CancellationToken::new())
            .await
            .unwrap();

        let state = f.runtime.state();
        let provision = state.log.iter().position(|op| *op == "provision").unwrap();
        let start = state.log.iter().position(|op| *op == "start_task").unwrap();
        assert!(provision < start);
    }

    #[tokio::test]
    async fn image_change_recreates_container_and_task() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.runtime.state().exit_after = Some(Duration::from_millis(5));

        f.orchestrator.deploy("web", &cancel).await.unwrap();
        *f.resolver.reference.lock().unwrap() = Some("docker.io/library/nginx:1.28".to_owned());
        f.orchestrator.deploy("web", &cancel).await.unwrap();

        let state = f.runtime.state();
        assert_eq!(state.create_container_calls, 2);
        assert_eq!(state.create_task_calls, 2);
        assert_eq!(state.containers["web"], "docker.io/library/nginx:1.28");
        assert_eq!(
            *state.tasks["web"].status.borrow(),
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn zero_addresses_fails_deploy_and_rolls_back_task() {
        let f = fixture_with_addresses(vec![]);
        let err = f
            .orchestrator
            .deploy("web", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NetworkSetup(_)));
        let state = f.runtime.state();
        assert!(state.tasks.is_empty());
        assert!(state.log.contains(&"delete_task"));
        drop(state);
        assert!(f.directory.load("web").is_err());
    }

    #[tokio::test]
    async fn start_failure_deletes_task_but_leaves_stale_record() {
        let f = fixture();
        f.runtime.state().fail_start = true;

        let err = f
            .orchestrator
            .deploy("web", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Runtime(_)));
        assert!(f.runtime.state().tasks.is_empty());
        // the registered endpoint is knowingly left behind
        assert!(f.directory.load("web").is_ok());
    }

    #[tokio::test]
    async fn pull_failure_surfaces() {
        let f = fixture();
        f.runtime.state().fail_pull = true;

        let err = f
            .orchestrator
            .deploy("web", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImagePull(_)));
    }

    #[tokio::test]
    async fn deploy_unknown_workload_is_not_found() {
        let f = fixture();
        *f.resolver.reference.lock().unwrap() = None;

        let err = f
            .orchestrator
            .deploy("web", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn connect_failure_is_runtime_unavailable() {
        let f = fixture();
        let orchestrator = Orchestrator::new(
            Arc::new(FakeConnector {
                runtime: f.runtime.clone(),
                fail: AtomicBool::new(true),
            }),
            f.resolver.clone(),
            vec![],
            None,
        );

        let err = orchestrator
            .deploy("web", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RuntimeUnavailable(_)));
    }

    #[tokio::test]
    async fn undeploy_is_idempotent_and_removes_endpoint() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.runtime.state().exit_after = Some(Duration::from_millis(5));

        f.orchestrator.deploy("web", &cancel).await.unwrap();
        f.orchestrator.undeploy("web", &cancel).await.unwrap();

        assert!(f.runtime.state().tasks.is_empty());
        assert!(f.directory.load("web").is_err());

        // second call observes "no task" and succeeds
        f.orchestrator.undeploy("web", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn undeploy_unknown_container_is_not_found() {
        let f = fixture();
        let err = f
            .orchestrator
            .undeploy("web", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn graceful_stop_wins_when_task_exits_quickly() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.runtime.state().exit_after = Some(Duration::from_millis(50));
        f.runtime.state().exit_code = 137;

        f.orchestrator.deploy("web", &cancel).await.unwrap();

        let started = Instant::now();
        // non-zero exit codes are logged, never propagated
        f.orchestrator.undeploy("web", &cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_wins_when_task_never_exits() {
        let f = fixture();
        f.orchestrator
            .deploy("web", &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            deadline.cancel();
        });

        let started = Instant::now();
        let err = f.orchestrator.undeploy("web", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::ShutdownTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(1));

        // the task is left in an unknown running state, not deleted
        assert!(f.runtime.state().tasks.contains_key("web"));
    }

    #[tokio::test]
    async fn info_reports_metrics_for_running_task() {
        let f = fixture();
        f.orchestrator
            .deploy("web", &CancellationToken::new())
            .await
            .unwrap();

        let report = f.orchestrator.info("web").await.unwrap();
        assert_eq!(report.id, "web");
        assert_eq!(report.metrics["cpu_nanos"], 1_000_000);
    }

    #[tokio::test]
    async fn info_without_container_or_task_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.orchestrator.info("web").await,
            Err(Error::NotFound(_))
        ));

        // container without a task is also not found
        f.runtime
            .state()
            .containers
            .insert("web".into(), "docker.io/library/nginx:1.27".into());
        assert!(matches!(
            f.orchestrator.info("web").await,
            Err(Error::NotFound(_))
        ));
    }
}
