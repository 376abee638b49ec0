//! In-memory collaborators for tests.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;

use crate::oci::{ContainerStatus, ImageRef, OciError, OciRuntime, RuntimeKind};
use crate::probe::probe_key;
use crate::registry::{Registry, RegistryError};

/// Poll `check` until it holds or `timeout` elapses. Works with paused time.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    check()
}

#[derive(Debug, Clone)]
enum FakeRepo {
    Published(String),
    Forbidden,
    Unavailable,
}

/// A registry whose repositories are scripted by the test.
/// Unknown repositories do not exist.
#[derive(Default)]
pub struct FakeRegistry {
    repos: Mutex<HashMap<String, FakeRepo>>,
    lookups: Mutex<HashMap<String, usize>>,
}

impl FakeRegistry {
    pub fn publish(&self, namespace: &str, repo: &str, digest: &str) {
        self.set(namespace, repo, FakeRepo::Published(digest.to_owned()));
    }

    /// Every request for the repository fails with a 403.
    pub fn forbid(&self, namespace: &str, repo: &str) {
        self.set(namespace, repo, FakeRepo::Forbidden);
    }

    /// Every request for the repository fails with a 503.
    pub fn break_repo(&self, namespace: &str, repo: &str) {
        self.set(namespace, repo, FakeRepo::Unavailable);
    }

    /// How many digest lookups were made for the repository.
    pub fn lookups(&self, namespace: &str, repo: &str) -> usize {
        self.lookups
            .lock()
            .unwrap()
            .get(&probe_key(namespace, repo))
            .copied()
            .unwrap_or(0)
    }

    fn set(&self, namespace: &str, repo: &str, state: FakeRepo) {
        self.repos
            .lock()
            .unwrap()
            .insert(probe_key(namespace, repo), state);
    }

    fn resolve(&self, namespace: &str, repo: &str) -> Result<String, RegistryError> {
        let state = self
            .repos
            .lock()
            .unwrap()
            .get(&probe_key(namespace, repo))
            .cloned();

        match state {
            Some(FakeRepo::Published(digest)) => Ok(digest),
            Some(FakeRepo::Forbidden) => Err(RegistryError::Client {
                namespace: namespace.to_owned(),
                repo: repo.to_owned(),
                status: StatusCode::FORBIDDEN,
                message: "access denied".to_owned(),
            }),
            Some(FakeRepo::Unavailable) => Err(RegistryError::Server {
                namespace: namespace.to_owned(),
                repo: repo.to_owned(),
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "try again later".to_owned(),
            }),
            None => Err(RegistryError::NotFound {
                namespace: namespace.to_owned(),
                repo: repo.to_owned(),
                message: "object not found".to_owned(),
            }),
        }
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn latest_image_digest(
        &self,
        namespace: &str,
        repo: &str,
    ) -> Result<String, RegistryError> {
        *self
            .lookups
            .lock()
            .unwrap()
            .entry(probe_key(namespace, repo))
            .or_default() += 1;

        self.resolve(namespace, repo)
    }

    async fn test_repo(&self, namespace: &str, repo: &str) -> Result<(), RegistryError> {
        self.resolve(namespace, repo).map(|_| ())
    }

    fn url(&self) -> String {
        "https://registry.test".to_owned()
    }
}

/// An engine call recorded by `FakeRuntime`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Pull(String),
    Run(String),
    StopByImage(String),
    List(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOperation {
    Pull,
    Run,
    StopByImage,
    List,
}

/// A container engine that keeps its containers in memory.
pub struct FakeRuntime {
    kind: RuntimeKind,
    running: Mutex<HashMap<String, Vec<String>>>,
    calls: Mutex<Vec<RuntimeCall>>,
    failing: Mutex<HashSet<RuntimeOperation>>,
    delays: Mutex<HashMap<RuntimeOperation, Duration>>,
    next_id: AtomicUsize,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new(RuntimeKind::Podman)
    }
}

impl FakeRuntime {
    pub fn new(kind: RuntimeKind) -> Self {
        Self {
            kind,
            running: Mutex::default(),
            calls: Mutex::default(),
            failing: Mutex::default(),
            delays: Mutex::default(),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Pretend a container was started from `image` outside of the daemon.
    pub fn start_container(&self, image: &str) -> String {
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.running
            .lock()
            .unwrap()
            .entry(image.to_owned())
            .or_default()
            .push(id.clone());
        id
    }

    pub fn running(&self, image: &str) -> Vec<String> {
        self.running
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that changed something, leaving out container listings.
    pub fn mutations(&self) -> Vec<RuntimeCall> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, RuntimeCall::List(_)))
            .collect()
    }

    pub fn set_failing(&self, operation: RuntimeOperation, failing: bool) {
        let mut operations = self.failing.lock().unwrap();
        if failing {
            operations.insert(operation);
        } else {
            operations.remove(&operation);
        }
    }

    /// Make every call of `operation` take `delay` before completing.
    pub fn set_delay(&self, operation: RuntimeOperation, delay: Option<Duration>) {
        let mut delays = self.delays.lock().unwrap();
        match delay {
            Some(delay) => delays.insert(operation, delay),
            None => delays.remove(&operation),
        };
    }

    async fn stall(&self, operation: RuntimeOperation) {
        let delay = self.delays.lock().unwrap().get(&operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, call: RuntimeCall, operation: RuntimeOperation) -> Result<(), OciError> {
        let command = format!("{} {:?}", self.kind, call);
        self.calls.lock().unwrap().push(call);

        if self.failing.lock().unwrap().contains(&operation) {
            return Err(OciError::Command {
                command,
                status: "exit status: 125".to_owned(),
                output: "scripted failure".to_owned(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl OciRuntime for FakeRuntime {
    async fn pull_image(&self, image: &ImageRef) -> Result<(), OciError> {
        self.stall(RuntimeOperation::Pull).await;
        self.record(RuntimeCall::Pull(image.to_string()), RuntimeOperation::Pull)
    }

    async fn run_image(&self, image: &ImageRef) -> Result<(), OciError> {
        self.record(RuntimeCall::Run(image.to_string()), RuntimeOperation::Run)?;
        self.start_container(image.as_str());

        Ok(())
    }

    async fn stop_containers_by_image(&self, image: &ImageRef) -> Result<(), OciError> {
        self.stall(RuntimeOperation::StopByImage).await;
        self.record(
            RuntimeCall::StopByImage(image.to_string()),
            RuntimeOperation::StopByImage,
        )?;
        self.running.lock().unwrap().remove(image.as_str());

        Ok(())
    }

    async fn containers_using_image(
        &self,
        image: &ImageRef,
        _statuses: &[ContainerStatus],
    ) -> Result<Vec<String>, OciError> {
        self.record(RuntimeCall::List(image.to_string()), RuntimeOperation::List)?;

        Ok(self.running(image.as_str()))
    }

    async fn check_exists(&self) -> Result<bool, OciError> {
        Ok(true)
    }

    fn runtime_type(&self) -> RuntimeKind {
        self.kind
    }
}
