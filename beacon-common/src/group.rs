use std::future::Future;
use std::time::Duration;

use eyre::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::timeout::{with_timeout, TimeoutError};

/// A group of long-running tasks where the first one to finish ends the group.
///
/// Each task receives the group's cancellation token. Once any task returns,
/// successfully or not, the token is cancelled so siblings can wind down, and
/// `wait` gives them `grace_period` to do so before aborting them.
pub struct TaskGroup {
    tasks: JoinSet<(String, Result<()>)>,
    token: CancellationToken,
    grace_period: Duration,
}

impl TaskGroup {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            tasks: JoinSet::new(),
            token: CancellationToken::new(),
            grace_period,
        }
    }

    /// The token cancelled when the group starts winding down.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F, Fut>(&mut self, name: &str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.to_owned();
        let future = task(self.token.clone());

        self.tasks.spawn(async move { (name, future.await) });
    }

    /// Wait for the first task to finish and return its outcome.
    pub async fn wait(mut self) -> Result<()> {
        let first = match self.tasks.join_next().await {
            None => return Ok(()),
            Some(joined) => joined,
        };
        self.token.cancel();

        let result = match first {
            Ok((name, result)) => {
                match &result {
                    Ok(()) => tracing::info!(task = %name, "task finished, stopping group"),
                    Err(error) => {
                        tracing::error!(task = %name, %error, "task failed, stopping group")
                    }
                }
                result
            }
            Err(join_error) => {
                tracing::error!(error = %join_error, "task panicked, stopping group");
                Err(join_error.into())
            }
        };

        let remaining = self.tasks;
        let drained: Result<(), TimeoutError> =
            with_timeout(self.grace_period, "waiting for grouped tasks", move |_| async move {
                let mut remaining = remaining;
                while let Some(joined) = remaining.join_next().await {
                    match joined {
                        Ok((name, Err(error))) => {
                            tracing::warn!(task = %name, %error, "task failed while stopping")
                        }
                        Ok((name, Ok(()))) => tracing::debug!(task = %name, "task stopped"),
                        Err(join_error) => {
                            tracing::warn!(error = %join_error, "task panicked while stopping")
                        }
                    }
                }
                Ok(())
            })
            .await;

        if drained.is_err() {
            // Dropping the set (inside the timed-out future) already aborted the stragglers.
            tracing::warn!("grouped tasks did not stop within the grace period");
        }

        result
    }
}
