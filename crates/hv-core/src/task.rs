//! Polling waits for remote tasks
//!
//! Hosts only expose poll-based task status, so completion is observed by
//! querying at a fixed interval until the task is terminal, the timeout
//! elapses, or the caller cancels.

use std::time::Duration;

use log::debug;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{TaskInfo, TaskRef, TaskState, VimClient};
use crate::error::HypervisorError;
use crate::Result;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Clone)]
pub struct TaskWaitConfig {
    pub poll_interval: Duration,
    /// `None` waits until the task is terminal
    pub timeout: Option<Duration>,
}

impl Default for TaskWaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: Some(DEFAULT_TASK_TIMEOUT),
        }
    }
}

impl TaskWaitConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Poll `task` until it succeeds (returning its final info) or fails
/// (returning the host's message as [`HypervisorError::RemoteTask`]).
pub async fn wait_for_task(
    client: &dyn VimClient,
    task: &TaskRef,
    config: &TaskWaitConfig,
    cancel: &CancellationToken,
) -> Result<TaskInfo> {
    let start = Instant::now();

    loop {
        let info = client.task_info(task).await?;

        match info.state {
            TaskState::Success => return Ok(info),
            TaskState::Error => {
                return Err(HypervisorError::remote_task(
                    task.operation.clone(),
                    info.error
                        .unwrap_or_else(|| "unknown remote error".to_string()),
                ))
            }
            TaskState::Queued | TaskState::Running => {
                debug!("{} {} at {}%", task.operation, task.id, info.progress);
            }
        }

        if let Some(timeout) = config.timeout {
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(HypervisorError::Timeout {
                    operation: task.operation.clone(),
                    waited,
                });
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(HypervisorError::Cancelled),
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
}
