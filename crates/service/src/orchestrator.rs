//! Task group coordinating the process's long-running tasks.
//!
//! Every task shares one [`CancellationToken`]. The first task to return,
//! whether it succeeded or failed, cancels the token so its siblings wind
//! down; [`TaskGroup::wait`] then waits for all of them.

use std::future::Future;

use anyhow::anyhow;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct TaskGroup {
    token: CancellationToken,
    tasks: JoinSet<(String, anyhow::Result<()>)>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            tasks: JoinSet::new(),
        }
    }

    /// The shared lifecycle signal handed to tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let token = self.token.clone();
        self.tasks.spawn(async move {
            let result = task.await;
            token.cancel();
            (name, result)
        });
    }

    /// Cancel the group on SIGINT/SIGTERM.
    pub fn spawn_signal_handler(&mut self) {
        let token = self.token.clone();
        self.spawn("signals", async move {
            tokio::select! {
                _ = token.cancelled() => Ok(()),
                signal = shutdown_signal() => {
                    let signal = signal?;
                    info!(signal, "received termination signal, starting graceful shutdown");
                    Ok(())
                }
            }
        });
    }

    /// Wait for every task and return the first failure.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    info!(task = %name, "task stopped");
                    continue;
                }
                Ok((name, Err(err))) => {
                    error!(task = %name, error = %format!("{err:#}"), "task failed");
                    err.context(format!("task {name}"))
                }
                Err(join_err) => {
                    // The task never reached its own cancel call.
                    self.token.cancel();
                    warn!(error = %join_err, "task aborted");
                    anyhow!("task aborted: {join_err}")
                }
            };
            first_error.get_or_insert(failure);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Wait for a termination signal, returning its name.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            ctrl_c = tokio::signal::ctrl_c() => ctrl_c.map(|()| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|()| "SIGINT")
    }
}
