//! The probe set and the reconciliation loop driving the container engine.
//!
//! Critical sections on the probe map:
//! - read lock: `list_probes`, `get_probe`, `describe`, reconciliation snapshot;
//! - write lock: insert in `start_probe`, removal after a probe has exited.
//!
//! The lock is never held across an await.
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde_derive::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::oci::{ContainerStatus, ImageRef, OciError, OciRuntime, RuntimeKind};
use crate::probe::{probe_key, Probe, ProbeContext, ProbeSnapshot, ProbeStatus};
use crate::registry::Registry;
use crate::signal::SignalClosed;
use crate::timeout::{with_timeout, TimeoutError};

#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("probe {key} already exists")]
    AlreadyExists { key: String },
    #[error("probe {key} does not exist")]
    NotExist { key: String },
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("failed to {step} {image}: {error}")]
    Runtime {
        step: &'static str,
        image: ImageRef,
        #[source]
        error: OciError,
    },
    #[error("probe {key} has no digest to deploy")]
    NothingToDeploy { key: String },
    #[error("probe {key} exited before it could be resumed")]
    ProbeExited { key: String },
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

/// How a reconciliation pass ended for one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The target image was already running.
    Deduplicated,
    /// The target image was pulled and started.
    Deployed,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Stop the containers of every probe when the manager shuts down.
    pub clean_on_exit: bool,
    pub reconcile_interval: Duration,
    /// Bound for the clean-on-exit pass, and again for stopping the probes.
    pub cleanup_timeout: Duration,
    /// Bound for reconciling a single probe.
    pub runtime_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            clean_on_exit: false,
            reconcile_interval: Duration::from_secs(1),
            cleanup_timeout: Duration::from_secs(30),
            runtime_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeaconDescription {
    pub registry: String,
    pub probes: Vec<String>,
    pub runtime: RuntimeKind,
}

pub struct BeaconManager {
    probes: RwLock<HashMap<String, Arc<Probe>>>,
    oci: Arc<dyn OciRuntime>,
    registry: Arc<dyn Registry>,
    settings: ManagerSettings,
    close: CancellationToken,
    closed: CancellationToken,
    wake: Arc<Notify>,
}

impl BeaconManager {
    /// The manager closes itself, and every probe, when `shutdown` is cancelled.
    pub fn new(
        oci: Arc<dyn OciRuntime>,
        registry: Arc<dyn Registry>,
        settings: ManagerSettings,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            probes: RwLock::default(),
            oci,
            registry,
            settings,
            close: shutdown.child_token(),
            closed: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<dyn OciRuntime> {
        &self.oci
    }

    /// Start watching `namespace/repo`, polling every `poll_delay`.
    ///
    /// The repository is not checked here, see `Registry::test_repo`.
    pub fn start_probe(
        &self,
        namespace: &str,
        repo: &str,
        poll_delay: Duration,
    ) -> Result<(), BeaconError> {
        let key = probe_key(namespace, repo);
        let mut probes = self.write_probes();

        if probes.contains_key(&key) {
            return Err(BeaconError::AlreadyExists { key });
        }

        let context = ProbeContext {
            registry: self.registry.clone(),
            wake: self.wake.clone(),
        };
        let probe = Probe::spawn(namespace, repo, poll_delay, context, &self.close);
        probes.insert(key.clone(), probe);
        metrics::gauge!("beacon_probes").set(probes.len() as f64);

        tracing::info!(probe = %key, "probe created");
        Ok(())
    }

    /// Close a probe, wait for its task to exit and forget it.
    ///
    /// On timeout the probe has been told to close but stays listed until a
    /// later stop observes it gone.
    pub async fn stop_probe(
        &self,
        namespace: &str,
        repo: &str,
        timeout: Duration,
    ) -> Result<(), BeaconError> {
        let key = probe_key(namespace, repo);
        let probe = self
            .read_probes()
            .get(&key)
            .cloned()
            .ok_or_else(|| BeaconError::NotExist { key: key.clone() })?;

        probe.close();
        with_timeout(timeout, "stopping probe", |_| async {
            probe.closed().await;
            Ok::<_, BeaconError>(())
        })
        .await?;

        self.forget(&probe);
        tracing::info!(probe = %key, "probe removed");
        Ok(())
    }

    /// Stop every probe, one after the other, within `timeout` overall.
    pub async fn stop_probes(&self, timeout: Duration) -> Result<(), BeaconError> {
        let probes: Vec<Arc<Probe>> = self.read_probes().values().cloned().collect();
        if probes.is_empty() {
            return Ok(());
        }

        with_timeout(timeout, "stopping all probes", move |_| async move {
            for probe in probes {
                probe.close();
                probe.closed().await;
                self.forget(&probe);
            }
            Ok::<_, BeaconError>(())
        })
        .await?;

        tracing::info!("all probes removed");
        Ok(())
    }

    pub fn list_probes(&self) -> Vec<String> {
        self.read_probes().keys().cloned().collect()
    }

    pub fn get_probe(&self, namespace: &str, repo: &str) -> Option<ProbeSnapshot> {
        self.read_probes()
            .get(&probe_key(namespace, repo))
            .map(|probe| probe.snapshot())
    }

    pub fn describe(&self) -> BeaconDescription {
        BeaconDescription {
            registry: self.registry.url(),
            probes: self.list_probes(),
            runtime: self.oci.runtime_type(),
        }
    }

    /// Reconcile outdated probes until the manager is closed, then run the
    /// exit path: optional container cleanup and stopping every probe.
    pub async fn run(&self) {
        let _closed = self.closed.clone().drop_guard();

        let mut interval = tokio::time::interval(self.settings.reconcile_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.close.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }

            tokio::select! {
                biased;
                _ = self.close.cancelled() => break,
                _ = self.reconcile_outdated() => {}
            }
        }

        tracing::info!("reconciliation loop stopped");
        self.exit().await;
    }

    /// Close the manager and wait for `run` to finish its exit path.
    pub async fn shutdown(&self) {
        self.close.cancel();
        self.closed.cancelled().await;
    }

    async fn reconcile_outdated(&self) {
        let outdated: Vec<Arc<Probe>> = self
            .read_probes()
            .values()
            .filter(|probe| probe.status() == ProbeStatus::Outdated && !probe.is_closing())
            .cloned()
            .collect();

        for probe in outdated {
            let started = Instant::now();
            let result = with_timeout(self.settings.runtime_timeout, "reconciling probe", |_| {
                self.reconcile(&probe)
            })
            .await;
            metrics::histogram!("beacon_reconciliation_duration_seconds")
                .record(started.elapsed().as_secs_f64());

            let outcome = match &result {
                Ok(Reconciliation::Deduplicated) => "deduplicated",
                Ok(Reconciliation::Deployed) => "deployed",
                Err(ReconcileError::Timeout(_)) => "timeout",
                Err(_) => "failed",
            };
            metrics::counter!("beacon_reconciliations_total", "outcome" => outcome).increment(1);

            match result {
                Ok(reconciliation) => {
                    tracing::info!(probe = %probe.key(), ?reconciliation, "probe reconciled")
                }
                Err(error) => {
                    tracing::error!(
                        probe = %probe.key(),
                        %error,
                        "reconciliation failed, will retry"
                    )
                }
            }
        }
    }

    /// Bring the engine in line with the latest digest of `probe` and resume it.
    pub async fn reconcile(&self, probe: &Probe) -> Result<Reconciliation, ReconcileError> {
        let snapshot = probe.snapshot();
        let latest = snapshot
            .latest_digest
            .ok_or_else(|| ReconcileError::NothingToDeploy {
                key: probe.key().to_owned(),
            })?;
        let target = ImageRef::new(probe.namespace(), probe.repo(), &latest);

        let running = self
            .oci
            .containers_using_image(&target, &[ContainerStatus::Running])
            .await
            .map_err(|error| runtime_error("list containers of", &target, error))?;

        let reconciliation = if running.is_empty() {
            self.oci
                .pull_image(&target)
                .await
                .map_err(|error| runtime_error("pull", &target, error))?;

            if let Some(current) = snapshot.current_digest {
                let previous = ImageRef::new(probe.namespace(), probe.repo(), &current);
                self.oci
                    .stop_containers_by_image(&previous)
                    .await
                    .map_err(|error| runtime_error("stop containers of", &previous, error))?;
            }

            self.oci
                .run_image(&target)
                .await
                .map_err(|error| runtime_error("run", &target, error))?;

            Reconciliation::Deployed
        } else {
            tracing::info!(probe = %probe.key(), image = %target, "image already running");
            Reconciliation::Deduplicated
        };

        probe
            .resume()
            .await
            .map_err(|SignalClosed| ReconcileError::ProbeExited {
                key: probe.key().to_owned(),
            })?;

        Ok(reconciliation)
    }

    async fn exit(&self) {
        if self.settings.clean_on_exit {
            self.clean_up().await;
        }

        if let Err(error) = self.stop_probes(self.settings.cleanup_timeout).await {
            tracing::error!(%error, "failed to stop probes");
        }
    }

    /// Best-effort stop of every container started for a remaining probe.
    async fn clean_up(&self) {
        let mut images: Vec<ImageRef> = Vec::new();
        for probe in self.read_probes().values() {
            let snapshot = probe.snapshot();
            for digest in [snapshot.current_digest, snapshot.latest_digest]
                .into_iter()
                .flatten()
            {
                let image = ImageRef::new(&snapshot.namespace, &snapshot.repo, &digest);
                if !images.contains(&image) {
                    images.push(image);
                }
            }
        }

        let cleaned: Result<(), TimeoutError> =
            with_timeout(self.settings.cleanup_timeout, "cleaning up containers", |_| async {
                for image in &images {
                    if let Err(error) = self.oci.stop_containers_by_image(image).await {
                        tracing::error!(image = %image, %error, "failed to clean up containers");
                    }
                }
                Ok(())
            })
            .await;

        if cleaned.is_ok() {
            tracing::info!(images = images.len(), "cleaned up containers");
        }
    }

    /// Drop `probe` from the map, unless the key now belongs to another probe.
    fn forget(&self, probe: &Arc<Probe>) {
        let mut probes = self.write_probes();

        if probes
            .get(probe.key())
            .is_some_and(|current| Arc::ptr_eq(current, probe))
        {
            probes.remove(probe.key());
        }
        metrics::gauge!("beacon_probes").set(probes.len() as f64);
    }

    fn read_probes(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Probe>>> {
        self.probes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_probes(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Probe>>> {
        self.probes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn runtime_error(step: &'static str, image: &ImageRef, error: OciError) -> ReconcileError {
    ReconcileError::Runtime {
        step,
        image: image.clone(),
        error,
    }
}
