//! Periodic maintenance: dedup, prune and promotion passes on a schedule.
//!
//! The loop wakes every `check_interval_secs`, runs whatever is due on the
//! blocking pool, and keeps a bounded history. A failing group is logged and
//! skipped; the remaining groups still run.

use crate::curator::Curator;
use crate::pruner::PruneOptions;
use chrono::{DateTime, Utc};
use playbook_core::config::{MaintenanceConfig, PrunePolicy, Schedule};
use playbook_core::{Group, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceTask {
    Dedup,
    Prune,
    Promote,
}

impl MaintenanceTask {
    pub const ALL: [MaintenanceTask; 3] = [MaintenanceTask::Dedup, MaintenanceTask::Prune, MaintenanceTask::Promote];

    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceTask::Dedup => "dedup",
            MaintenanceTask::Prune => "prune",
            MaintenanceTask::Promote => "promote",
        }
    }
}

impl fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupFailure {
    pub group: Group,
    pub error: String,
}

/// One execution of one task across the configured groups.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub task: MaintenanceTask,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: Vec<Group>,
    pub failed: Vec<GroupFailure>,
    /// Bullets archived, pruned or promoted.
    pub changed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task: MaintenanceTask,
    pub schedule: Schedule,
    pub last_run: Option<DateTime<Utc>>,
    /// None for manual tasks.
    pub next_run: Option<DateTime<Utc>>,
}

pub struct MaintenanceScheduler {
    curator: Arc<Curator>,
    config: MaintenanceConfig,
    policy: PrunePolicy,
    state: Mutex<RunState>,
}

#[derive(Default)]
struct RunState {
    last_run: HashMap<MaintenanceTask, DateTime<Utc>>,
    history: VecDeque<TaskRun>,
}

impl MaintenanceScheduler {
    pub fn new(curator: Arc<Curator>, config: MaintenanceConfig, policy: PrunePolicy) -> Self {
        Self { curator, config, policy, state: Mutex::new(RunState::default()) }
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_run(&self, task: MaintenanceTask) -> Option<DateTime<Utc>> {
        self.state().last_run.get(&task).copied()
    }

    pub fn schedule(&self, task: MaintenanceTask) -> Schedule {
        match task {
            MaintenanceTask::Dedup => self.config.dedup_schedule,
            MaintenanceTask::Prune => self.config.prune_schedule,
            MaintenanceTask::Promote => self.config.promote_schedule,
        }
    }

    fn next_run(&self, task: MaintenanceTask) -> Option<DateTime<Utc>> {
        let period = self.schedule(task).period()?;
        Some(self.last_run(task).map_or_else(Utc::now, |last| last + period))
    }

    /// Scheduled tasks whose period has elapsed. Tasks that never ran are due.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Vec<MaintenanceTask> {
        MaintenanceTask::ALL
            .into_iter()
            .filter(|task| match self.schedule(*task).period() {
                None => false,
                Some(period) => self.last_run(*task).map_or(true, |last| now - last >= period),
            })
            .collect()
    }

    pub fn run_due(&self, now: DateTime<Utc>) -> Vec<TaskRun> {
        self.due_tasks(now).into_iter().map(|task| self.run_task(task, now)).collect()
    }

    /// Run `task` now, regardless of schedule.
    pub fn run_task(&self, task: MaintenanceTask, now: DateTime<Utc>) -> TaskRun {
        let started_at = Utc::now();
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut changed = 0;

        for group in self.config.groups.clone() {
            if task == MaintenanceTask::Promote && !group.is_agent() {
                continue;
            }
            match self.run_for_group(task, group) {
                Ok(n) => {
                    changed += n;
                    succeeded.push(group);
                }
                Err(e) => {
                    warn!(%task, %group, "maintenance failed for group: {}", e);
                    failed.push(GroupFailure { group, error: e.to_string() });
                }
            }
        }

        let run = TaskRun { task, started_at, finished_at: Utc::now(), succeeded, failed, changed };
        info!(%task, changed, failed = run.failed.len(), "maintenance task finished");
        let mut state = self.state();
        state.last_run.insert(task, now);
        state.history.push_back(run.clone());
        while state.history.len() > self.config.history_limit.max(1) {
            state.history.pop_front();
        }
        run
    }

    fn run_for_group(&self, task: MaintenanceTask, group: Group) -> Result<usize> {
        match task {
            MaintenanceTask::Dedup => Ok(self.curator.deduplicate(&[group], None, false)?.bullets_archived()),
            MaintenanceTask::Prune => {
                let options = PruneOptions::new(self.policy).actor("scheduler");
                Ok(self.curator.prune_low_quality(group, &options)?.pruned.len())
            }
            MaintenanceTask::Promote => Ok(self.curator.promote_eligible(group)?.len()),
        }
    }

    /// Most recent runs, oldest first.
    pub fn history(&self) -> Vec<TaskRun> {
        self.state().history.iter().cloned().collect()
    }

    pub fn status(&self) -> Vec<TaskStatus> {
        MaintenanceTask::ALL
            .into_iter()
            .map(|task| TaskStatus {
                task,
                schedule: self.schedule(task),
                last_run: self.last_run(task),
                next_run: self.next_run(task),
            })
            .collect()
    }

    /// Check for due work every `check_interval_secs` until cancelled. Passes
    /// touch the disk, so they run on the blocking pool.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.check_interval_secs.max(1));
        info!("Maintenance scheduler started, checking every {}s", interval.as_secs());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    let this = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || this.run_due(Utc::now())).await {
                        Ok(runs) if !runs.is_empty() => info!(tasks = runs.len(), "scheduled maintenance ran"),
                        Ok(_) => {}
                        Err(e) => warn!("maintenance pass aborted: {}", e),
                    }
                }
            }
        }
        info!("Maintenance scheduler stopped");
    }
}
