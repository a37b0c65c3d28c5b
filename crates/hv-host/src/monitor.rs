//! Background loops for one host
//!
//! The refresh loop keeps the shared VM cache in line with the host
//! inventory, sweeps idle networks and closes idle sessions. The task
//! monitor follows the tasks foreground operations did not wait for. Both
//! stop when the service cancels its token.

use std::sync::Arc;
use std::time::Duration;

use labvisor_core::TaskState;
use labvisor_shared_types::VmTask;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::connection::{HostConnection, TrackedTask};

impl HostConnection {
    /// Spawn the refresh and task monitor loops for this host.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let refresh = Duration::from_secs(self.config().cache_refresh_secs);
        let monitor = Duration::from_secs(self.config().task_monitor_secs);

        vec![
            tokio::spawn(run_refresh_loop(self.clone(), refresh)),
            tokio::spawn(run_task_monitor_loop(self.clone(), monitor)),
        ]
    }

    /// One refresh pass: reload the inventory, then sweep networks whose
    /// grace period ran out. Does nothing while the session is parked.
    pub async fn refresh_tick(&self) {
        if self.session().disconnect_if_idle().await || self.session().is_parked() {
            return;
        }
        if let Err(e) = self.reload().await {
            warn!("Inventory refresh of {} failed: {}", self.name(), e);
            return;
        }

        let removed = self.network().clean(None).await;
        if !removed.is_empty() {
            debug!("Swept {} on {}", removed.join(", "), self.name());
        }
    }

    /// One task monitor pass over every tracked task.
    pub async fn monitor_tick(&self) {
        if self.session().is_parked() {
            return;
        }

        let vm_tasks: Vec<(String, TrackedTask)> = self
            .vm_tasks
            .lock()
            .await
            .iter()
            .map(|(id, t)| (id.clone(), t.clone()))
            .collect();
        let disk_tasks: Vec<(String, TrackedTask)> = self
            .disk_tasks
            .lock()
            .await
            .iter()
            .map(|(path, t)| (path.clone(), t.clone()))
            .collect();

        if vm_tasks.is_empty() && disk_tasks.is_empty() {
            return;
        }
        if let Err(e) = self.session().connect().await {
            warn!("Task monitor cannot reach {}: {}", self.name(), e);
            return;
        }

        for (task_id, tracked) in vm_tasks {
            if let Some(progress) = self.poll(&tracked.owner, &tracked).await {
                match progress {
                    Progress::Running(value) => {
                        if let Some(t) = self.vm_tasks.lock().await.get_mut(&task_id) {
                            t.progress = value;
                        }
                        self.cache()
                            .update(&tracked.owner, |vm| {
                                if let Some(task) = vm.task.as_mut().filter(|t| t.id == task_id) {
                                    task.progress = value;
                                }
                            })
                            .await;
                    }
                    Progress::Done => {
                        let next = {
                            let mut tasks = self.vm_tasks.lock().await;
                            tasks.remove(&task_id);
                            tasks.values().find(|t| t.owner == tracked.owner).cloned()
                        };
                        let next = next.map(|t| VmTask {
                            progress: t.progress,
                            ..VmTask::new(t.task.id, t.label)
                        });
                        self.cache().update(&tracked.owner, |vm| vm.task = next).await;
                    }
                }
            }
        }

        for (path, tracked) in disk_tasks {
            if let Some(progress) = self.poll(&path, &tracked).await {
                let mut tasks = self.disk_tasks.lock().await;
                match progress {
                    Progress::Running(value) => {
                        if let Some(t) = tasks.get_mut(&path) {
                            t.progress = value;
                        }
                    }
                    Progress::Done => {
                        tasks.remove(&path);
                    }
                }
            }
        }
    }

    /// `None` when the task could not be read this round.
    async fn poll(&self, subject: &str, tracked: &TrackedTask) -> Option<Progress> {
        match self.client().task_info(&tracked.task).await {
            Ok(info) => match info.state {
                TaskState::Success => Some(Progress::Done),
                TaskState::Error => {
                    self.warn_failed_task(subject, &info);
                    Some(Progress::Done)
                }
                TaskState::Queued | TaskState::Running => Some(Progress::Running(info.progress)),
            },
            Err(e) if e.is_connection_fault() => {
                self.session().fault(&e).await;
                None
            }
            Err(e) => {
                debug!("Dropping task {} for {}: {}", tracked.task.id, subject, e);
                Some(Progress::Done)
            }
        }
    }
}

enum Progress {
    Running(i32),
    Done,
}

async fn run_refresh_loop(host: Arc<HostConnection>, period: Duration) {
    let cancel = host.cancel_token().clone();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Inventory refresh for {} every {:?}", host.name(), period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Inventory refresh for {} stopped", host.name());
                break;
            }
            _ = ticker.tick() => host.refresh_tick().await,
        }
    }
}

async fn run_task_monitor_loop(host: Arc<HostConnection>, period: Duration) {
    let cancel = host.cancel_token().clone();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Task monitor for {} every {:?}", host.name(), period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Task monitor for {} stopped", host.name());
                break;
            }
            _ = ticker.tick() => host.monitor_tick().await,
        }
    }
}
