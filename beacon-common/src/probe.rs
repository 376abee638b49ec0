//! Per-repository watchers.
//!
//! A probe polls the registry for the latest digest of one `namespace/repo`
//! pair. When the digest moves away from the deployed one the probe turns
//! `Outdated`, wakes the manager and parks until the manager resumes it.
use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_derive::Serialize;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;
use crate::signal::{self, SignalClosed, SignalReceiver, SignalSender};

/// The key identifying a probe inside a manager.
pub fn probe_key(namespace: &str, repo: &str) -> String {
    format!("{namespace}/{repo}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Starting,
    Probing,
    Outdated,
    Exited,
}

impl ProbeStatus {
    pub fn can_transition_to(self, next: ProbeStatus) -> bool {
        matches!(
            (self, next),
            (ProbeStatus::Starting, ProbeStatus::Probing)
                | (ProbeStatus::Probing, ProbeStatus::Probing)
                | (ProbeStatus::Probing, ProbeStatus::Outdated)
                | (ProbeStatus::Probing, ProbeStatus::Exited)
                | (ProbeStatus::Outdated, ProbeStatus::Probing)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Starting => "starting",
            ProbeStatus::Probing => "probing",
            ProbeStatus::Outdated => "outdated",
            ProbeStatus::Exited => "exited",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct ProbeState {
    status: ProbeStatus,
    current_digest: Option<String>,
    latest_digest: Option<String>,
    last_checked: Option<OffsetDateTime>,
    last_updated: Option<OffsetDateTime>,
}

impl ProbeState {
    fn transition(&mut self, key: &str, next: ProbeStatus) {
        if self.status.can_transition_to(next) {
            self.status = next;
        } else {
            tracing::warn!(
                probe = key,
                from = %self.status,
                to = %next,
                "ignoring invalid probe transition"
            );
        }
    }
}

/// A point-in-time copy of a probe's fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSnapshot {
    pub namespace: String,
    pub repo: String,
    pub status: ProbeStatus,
    pub current_digest: Option<String>,
    pub latest_digest: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_checked: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    /// Set once the probe has been asked to stop.
    pub closing: bool,
}

/// What a probe task needs from its owner.
#[derive(Clone)]
pub struct ProbeContext {
    pub registry: Arc<dyn Registry>,
    /// Notified whenever the probe becomes `Outdated`.
    pub wake: Arc<Notify>,
}

pub struct Probe {
    namespace: String,
    repo: String,
    key: String,
    state: RwLock<ProbeState>,
    close: CancellationToken,
    exited: CancellationToken,
    resume: SignalSender,
}

impl Probe {
    /// Create a probe in `Starting` and launch its polling task.
    ///
    /// The probe is closed when `parent` is cancelled, or through `close`.
    pub fn spawn(
        namespace: &str,
        repo: &str,
        poll_delay: Duration,
        context: ProbeContext,
        parent: &CancellationToken,
    ) -> Arc<Probe> {
        let (resume, resumed) = signal::channel();
        let probe = Arc::new(Probe {
            namespace: namespace.to_owned(),
            repo: repo.to_owned(),
            key: probe_key(namespace, repo),
            state: RwLock::new(ProbeState {
                status: ProbeStatus::Starting,
                current_digest: None,
                latest_digest: None,
                last_checked: None,
                last_updated: None,
            }),
            close: parent.child_token(),
            exited: CancellationToken::new(),
            resume,
        });

        tokio::spawn(probe.clone().watch(poll_delay, context, resumed));

        probe
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> ProbeStatus {
        self.read(|state| state.status)
    }

    pub fn snapshot(&self) -> ProbeSnapshot {
        self.read(|state| ProbeSnapshot {
            namespace: self.namespace.clone(),
            repo: self.repo.clone(),
            status: state.status,
            current_digest: state.current_digest.clone(),
            latest_digest: state.latest_digest.clone(),
            last_checked: state.last_checked,
            last_updated: state.last_updated,
            closing: self.close.is_cancelled(),
        })
    }

    /// Ask the polling task to stop. Returns immediately.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Wait until the polling task has exited.
    pub async fn closed(&self) {
        self.exited.cancelled().await
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Hand an `Outdated` probe back to polling once its latest digest is deployed.
    ///
    /// Returns after the probe has recorded the latest digest as current and
    /// switched to `Probing`, or fails if the task exited first.
    pub async fn resume(&self) -> Result<(), SignalClosed> {
        self.resume.send().await
    }

    fn read<R>(&self, f: impl FnOnce(&ProbeState) -> R) -> R {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    fn update<R>(&self, f: impl FnOnce(&mut ProbeState) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    async fn watch(
        self: Arc<Self>,
        poll_delay: Duration,
        context: ProbeContext,
        mut resumed: SignalReceiver,
    ) {
        let _exited = self.exited.clone().drop_guard();

        self.update(|state| state.transition(&self.key, ProbeStatus::Probing));
        tracing::info!(probe = %self.key, ?poll_delay, "probe started");

        loop {
            let step = match self.status() {
                ProbeStatus::Probing => self.poll(poll_delay, &context).await,
                ProbeStatus::Outdated => self.await_resume(&mut resumed).await,
                ProbeStatus::Starting | ProbeStatus::Exited => ControlFlow::Break(()),
            };
            if step.is_break() {
                break;
            }
        }

        tracing::info!(probe = %self.key, status = %self.status(), "probe stopped");
    }

    async fn poll(&self, poll_delay: Duration, context: &ProbeContext) -> ControlFlow<()> {
        let lookup = tokio::select! {
            biased;
            _ = self.close.cancelled() => return ControlFlow::Break(()),
            lookup = context.registry.latest_image_digest(&self.namespace, &self.repo) => lookup,
        };

        let digest = match lookup {
            Ok(digest) => digest,
            Err(error) => {
                tracing::error!(
                    probe = %self.key,
                    %error,
                    "failed to fetch latest digest, probe exiting"
                );
                metrics::counter!("beacon_probe_polls_total", "outcome" => "failed").increment(1);
                self.update(|state| state.transition(&self.key, ProbeStatus::Exited));
                return ControlFlow::Break(());
            }
        };

        if self.record_digest(digest) {
            metrics::counter!("beacon_probe_polls_total", "outcome" => "changed").increment(1);
            context.wake.notify_one();
            return ControlFlow::Continue(());
        }
        metrics::counter!("beacon_probe_polls_total", "outcome" => "unchanged").increment(1);

        tokio::select! {
            biased;
            _ = self.close.cancelled() => ControlFlow::Break(()),
            _ = tokio::time::sleep(poll_delay) => ControlFlow::Continue(()),
        }
    }

    /// Record a successful lookup. Returns whether the probe became `Outdated`.
    fn record_digest(&self, digest: String) -> bool {
        let now = OffsetDateTime::now_utc();

        self.update(|state| {
            state.last_checked = Some(now);
            if state.current_digest.as_deref() == Some(digest.as_str()) {
                return false;
            }

            tracing::info!(
                probe = %self.key,
                current = state.current_digest.as_deref().unwrap_or(""),
                latest = %digest,
                "new digest published"
            );
            state.latest_digest = Some(digest);
            state.last_updated = Some(now);
            state.transition(&self.key, ProbeStatus::Outdated);
            true
        })
    }

    async fn await_resume(&self, resumed: &mut SignalReceiver) -> ControlFlow<()> {
        let delivery = tokio::select! {
            biased;
            _ = self.close.cancelled() => return ControlFlow::Break(()),
            delivery = resumed.recv() => delivery,
        };

        let Some(delivery) = delivery else {
            return ControlFlow::Break(());
        };

        self.update(|state| {
            state.current_digest = state.latest_digest.clone();
            state.transition(&self.key, ProbeStatus::Probing);
        });
        delivery.confirm();

        ControlFlow::Continue(())
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("key", &self.key)
            .field("state", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{wait_until, FakeRegistry};

    const POLL: Duration = Duration::from_secs(5);

    fn spawn_probe(
        registry: &Arc<FakeRegistry>,
        parent: &CancellationToken,
    ) -> (Arc<Probe>, Arc<Notify>) {
        let wake = Arc::new(Notify::new());
        let context = ProbeContext {
            registry: registry.clone(),
            wake: wake.clone(),
        };

        (Probe::spawn("acme", "app", POLL, context, parent), wake)
    }

    #[test]
    fn only_documented_transitions_are_allowed() {
        let all = [
            ProbeStatus::Starting,
            ProbeStatus::Probing,
            ProbeStatus::Outdated,
            ProbeStatus::Exited,
        ];
        let allowed: Vec<_> = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();

        assert_eq!(
            allowed,
            vec![
                (ProbeStatus::Starting, ProbeStatus::Probing),
                (ProbeStatus::Probing, ProbeStatus::Probing),
                (ProbeStatus::Probing, ProbeStatus::Outdated),
                (ProbeStatus::Probing, ProbeStatus::Exited),
                (ProbeStatus::Outdated, ProbeStatus::Probing),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_digest_makes_probe_outdated() {
        let registry = Arc::new(FakeRegistry::default());
        registry.publish("acme", "app", "sha256:aaa");

        let (probe, wake) = spawn_probe(&registry, &CancellationToken::new());
        wake.notified().await;

        let snapshot = probe.snapshot();
        assert_eq!(snapshot.status, ProbeStatus::Outdated);
        assert_eq!(snapshot.current_digest, None);
        assert_eq!(snapshot.latest_digest.as_deref(), Some("sha256:aaa"));
        assert!(snapshot.last_checked.is_some());
        assert_eq!(snapshot.last_updated, snapshot.last_checked);
        assert_eq!(probe.key(), "acme/app");
    }

    #[tokio::test(start_paused = true)]
    async fn outdated_probe_stops_polling_until_resumed() {
        let registry = Arc::new(FakeRegistry::default());
        registry.publish("acme", "app", "sha256:aaa");

        let (probe, wake) = spawn_probe(&registry, &CancellationToken::new());
        wake.notified().await;

        tokio::time::sleep(POLL * 10).await;
        assert_eq!(registry.lookups("acme", "app"), 1);
        assert_eq!(probe.status(), ProbeStatus::Outdated);

        probe.resume().await.unwrap();

        let snapshot = probe.snapshot();
        assert_eq!(snapshot.status, ProbeStatus::Probing);
        assert_eq!(snapshot.current_digest.as_deref(), Some("sha256:aaa"));
        assert_eq!(snapshot.latest_digest, snapshot.current_digest);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_digest_only_updates_last_checked() {
        let registry = Arc::new(FakeRegistry::default());
        registry.publish("acme", "app", "sha256:aaa");

        let (probe, wake) = spawn_probe(&registry, &CancellationToken::new());
        wake.notified().await;
        probe.resume().await.unwrap();
        let resumed = probe.snapshot();

        assert!(wait_until(POLL * 4, || registry.lookups("acme", "app") >= 3).await);

        let later = probe.snapshot();
        assert_eq!(later.status, ProbeStatus::Probing);
        assert_eq!(later.last_updated, resumed.last_updated);
        assert!(later.last_checked >= resumed.last_checked);
        assert_eq!(later.current_digest.as_deref(), Some("sha256:aaa"));
    }

    #[tokio::test(start_paused = true)]
    async fn changed_digest_makes_probe_outdated_again() {
        let registry = Arc::new(FakeRegistry::default());
        registry.publish("acme", "app", "sha256:aaa");

        let (probe, wake) = spawn_probe(&registry, &CancellationToken::new());
        wake.notified().await;
        probe.resume().await.unwrap();

        registry.publish("acme", "app", "sha256:bbb");
        wake.notified().await;

        let snapshot = probe.snapshot();
        assert_eq!(snapshot.status, ProbeStatus::Outdated);
        assert_eq!(snapshot.current_digest.as_deref(), Some("sha256:aaa"));
        assert_eq!(snapshot.latest_digest.as_deref(), Some("sha256:bbb"));
    }

    #[tokio::test(start_paused = true)]
    async fn registry_failure_exits_probe() {
        let registry = Arc::new(FakeRegistry::default());
        registry.break_repo("acme", "app");

        let (probe, _) = spawn_probe(&registry, &CancellationToken::new());
        probe.closed().await;

        assert_eq!(probe.status(), ProbeStatus::Exited);
        assert!(probe.has_exited());
        assert!(!probe.is_closing());
        assert_eq!(probe.resume().await, Err(SignalClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn close_interrupts_poll_sleep() {
        let registry = Arc::new(FakeRegistry::default());
        registry.publish("acme", "app", "sha256:aaa");

        let (probe, wake) = spawn_probe(&registry, &CancellationToken::new());
        wake.notified().await;
        probe.resume().await.unwrap();
        assert!(wait_until(Duration::from_secs(1), || registry.lookups("acme", "app") == 2).await);

        let started = tokio::time::Instant::now();
        probe.close();
        probe.closed().await;

        assert!(started.elapsed() < POLL);
        assert_eq!(probe.status(), ProbeStatus::Probing);
        assert!(probe.snapshot().closing);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_closes_outdated_probe() {
        let registry = Arc::new(FakeRegistry::default());
        registry.publish("acme", "app", "sha256:aaa");
        let parent = CancellationToken::new();

        let (probe, wake) = spawn_probe(&registry, &parent);
        wake.notified().await;

        parent.cancel();
        probe.closed().await;

        assert_eq!(probe.status(), ProbeStatus::Outdated);
        assert_eq!(probe.resume().await, Err(SignalClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn close_wins_over_pending_resume() {
        let registry = Arc::new(FakeRegistry::default());
        registry.publish("acme", "app", "sha256:aaa");

        let (probe, wake) = spawn_probe(&registry, &CancellationToken::new());
        wake.notified().await;

        // Queue the resume without yielding to the probe task, then close it.
        let resume = probe.resume();
        tokio::pin!(resume);
        tokio::select! {
            biased;
            result = &mut resume => panic!("resume finished before the probe ran: {result:?}"),
            _ = std::future::ready(()) => {}
        }
        probe.close();
        probe.closed().await;

        assert_eq!(resume.await, Err(SignalClosed));
        let snapshot = probe.snapshot();
        assert_eq!(snapshot.status, ProbeStatus::Outdated);
        assert_eq!(snapshot.current_digest, None);
        assert_eq!(snapshot.latest_digest.as_deref(), Some("sha256:aaa"));
    }
}
