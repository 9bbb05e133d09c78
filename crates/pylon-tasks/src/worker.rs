//! Single-active-worker-per-workspace orchestration.
//!
//! The orchestrator owns one `WorkerState` per workspace and serializes
//! every transition through one lock, so a workspace never has two
//! tasks running at once. Delegation goes through the `TaskRunner`
//! seam; completion is reported back by the caller when the delegated
//! session finishes.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use pylon_core::now_millis;

use crate::task_store::{Task, TaskError, TaskStatus, TaskStore};

/// Worker activity status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Running,
}

/// Per-workspace worker snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
}

/// Delegation target for started tasks.
///
/// The transport layer implements this over the session engine; tests
/// use a scripted runner.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Kick off the task's work. Returning `Err` means delegation
    /// itself failed; the task is marked failed without retry.
    async fn run(&self, task: &Task) -> Result<(), String>;
}

/// FIFO task scheduler, one worker slot per workspace.
pub struct Orchestrator {
    store: Arc<TaskStore>,
    runner: Arc<dyn TaskRunner>,
    workers: Mutex<HashMap<String, WorkerState>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(store: Arc<TaskStore>, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            store,
            runner,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of a workspace's worker state.
    pub async fn worker(&self, workspace_id: &str) -> WorkerState {
        self.workers
            .lock()
            .await
            .get(workspace_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the workspace's worker is idle with a pending task queued.
    pub async fn can_start(&self, workspace_id: &str) -> bool {
        let workers = self.workers.lock().await;
        let idle = workers
            .get(workspace_id)
            .is_none_or(|w| w.status == WorkerStatus::Idle);
        idle && self.store.next_pending(workspace_id).is_some()
    }

    /// Start the oldest pending task if the worker is idle.
    ///
    /// Returns the started task, or `None` when nothing can start. On
    /// delegation failure the task is marked failed and the worker
    /// returns to idle.
    ///
    /// # Errors
    /// Returns an error if a status transition cannot be persisted.
    pub async fn start(&self, workspace_id: &str) -> Result<Option<Task>, TaskError> {
        let mut workers = self.workers.lock().await;
        self.start_locked(workspace_id, &mut workers).await
    }

    /// Record the running task's terminal status and advance the queue.
    ///
    /// # Errors
    /// Returns an error if the worker is not running or the transition
    /// cannot be persisted.
    pub async fn complete(
        &self,
        workspace_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), TaskError> {
        let mut workers = self.workers.lock().await;
        let task_id = running_task_id(&workers, workspace_id)?;

        self.store.mark_complete(&task_id, status, error)?;
        workers.insert(workspace_id.to_string(), WorkerState::default());

        // Auto-advance; a failed delegation frees the slot again, so
        // keep going until the queue drains or a task sticks.
        while self.start_locked(workspace_id, &mut workers).await?.is_some() {
            let still_running = workers
                .get(workspace_id)
                .is_some_and(|w| w.status == WorkerStatus::Running);
            if still_running {
                break;
            }
        }
        Ok(())
    }

    /// Demote the running task back to pending and free the worker.
    ///
    /// Does not touch the underlying session; callers compose both.
    ///
    /// # Errors
    /// Returns an error if the worker is not running.
    pub async fn stop(&self, workspace_id: &str) -> Result<(), TaskError> {
        let mut workers = self.workers.lock().await;
        let task_id = running_task_id(&workers, workspace_id)?;

        self.store.demote(&task_id)?;
        workers.insert(workspace_id.to_string(), WorkerState::default());
        Ok(())
    }

    async fn start_locked(
        &self,
        workspace_id: &str,
        workers: &mut HashMap<String, WorkerState>,
    ) -> Result<Option<Task>, TaskError> {
        let idle = workers
            .get(workspace_id)
            .is_none_or(|w| w.status == WorkerStatus::Idle);
        if !idle {
            return Ok(None);
        }
        let Some(task) = self.store.next_pending(workspace_id) else {
            return Ok(None);
        };

        let task = self.store.mark_running(&task.id)?;
        workers.insert(
            workspace_id.to_string(),
            WorkerState {
                status: WorkerStatus::Running,
                current_task_id: Some(task.id.clone()),
                started_at: Some(now_millis()),
            },
        );

        if let Err(e) = self.runner.run(&task).await {
            tracing::warn!("Task {} delegation failed: {e}", task.id);
            self.store
                .mark_complete(&task.id, TaskStatus::Failed, Some(e))?;
            workers.insert(workspace_id.to_string(), WorkerState::default());
        }
        Ok(Some(task))
    }
}

fn running_task_id(
    workers: &HashMap<String, WorkerState>,
    workspace_id: &str,
) -> Result<String, TaskError> {
    workers
        .get(workspace_id)
        .filter(|w| w.status == WorkerStatus::Running)
        .and_then(|w| w.current_task_id.clone())
        .ok_or_else(|| TaskError::NotFound(format!("no running task in {workspace_id}")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Runner that records run order and can fail specific tasks.
    #[derive(Default)]
    struct ScriptedRunner {
        ran: StdMutex<Vec<String>>,
        fail_titles: Vec<String>,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    #[async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run(&self, task: &Task) -> Result<(), String> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            self.ran.lock().unwrap().push(task.title.clone());
            if self.fail_titles.contains(&task.title) {
                return Err(format!("cannot run {}", task.title));
            }
            Ok(())
        }
    }

    fn setup(runner: ScriptedRunner) -> (Arc<TaskStore>, Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path().to_path_buf()).unwrap());
        let orch = Orchestrator::new(Arc::clone(&store), Arc::new(runner));
        (store, orch, dir)
    }

    #[tokio::test]
    async fn start_runs_the_oldest_pending_task() {
        let (store, orch, _dir) = setup(ScriptedRunner::default());
        store.create("ws-1", "first", "body").unwrap();
        store.create("ws-1", "second", "").unwrap();

        assert!(orch.can_start("ws-1").await);
        let started = orch.start("ws-1").await.unwrap().unwrap();
        assert_eq!(started.title, "first");

        let worker = orch.worker("ws-1").await;
        assert_eq!(worker.status, WorkerStatus::Running);
        assert_eq!(worker.current_task_id.as_deref(), Some(started.id.as_str()));

        // The slot is taken; nothing else starts.
        assert!(!orch.can_start("ws-1").await);
        assert!(orch.start("ws-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn never_two_running_tasks_per_workspace() {
        let (store, orch, _dir) = setup(ScriptedRunner::default());
        for i in 0..4 {
            store.create("ws-1", format!("t{i}"), "").unwrap();
        }
        let orch = Arc::new(orch);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let orch = Arc::clone(&orch);
            handles.push(tokio::spawn(async move { orch.start("ws-1").await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let running: Vec<Task> = store
            .list("ws-1")
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .collect();
        assert_eq!(running.len(), 1);

        let worker = orch.worker("ws-1").await;
        assert_eq!(worker.status, WorkerStatus::Running);
        assert_eq!(
            worker.current_task_id.as_deref(),
            Some(running[0].id.as_str())
        );
    }

    #[tokio::test]
    async fn worker_never_running_without_a_running_task() {
        let (store, orch, _dir) = setup(ScriptedRunner::default());
        let task = store.create("ws-1", "t", "").unwrap();

        orch.start("ws-1").await.unwrap();
        orch.complete("ws-1", TaskStatus::Done, None).await.unwrap();

        assert_eq!(orch.worker("ws-1").await.status, WorkerStatus::Idle);
        assert_eq!(store.get(&task.id).unwrap().status, TaskStatus::Done);
        assert!(
            !store
                .list("ws-1")
                .iter()
                .any(|t| t.status == TaskStatus::Running)
        );
    }

    #[tokio::test]
    async fn completion_auto_advances_in_fifo_order() {
        let (store, orch, _dir) = setup(ScriptedRunner::default());
        store.create("ws-1", "a", "").unwrap();
        store.create("ws-1", "b", "").unwrap();

        orch.start("ws-1").await.unwrap();
        orch.complete("ws-1", TaskStatus::Done, None).await.unwrap();

        // Completing "a" started "b" automatically.
        let worker = orch.worker("ws-1").await;
        assert_eq!(worker.status, WorkerStatus::Running);
        let running = store
            .list("ws-1")
            .into_iter()
            .find(|t| t.status == TaskStatus::Running)
            .unwrap();
        assert_eq!(running.title, "b");
    }

    #[tokio::test]
    async fn delegation_failure_marks_failed_and_frees_the_worker() {
        let runner = ScriptedRunner {
            fail_titles: vec!["bad".to_string()],
            ..Default::default()
        };
        let (store, orch, _dir) = setup(runner);
        let bad = store.create("ws-1", "bad", "").unwrap();
        store.create("ws-1", "good", "").unwrap();

        orch.start("ws-1").await.unwrap();
        let failed = store.get(&bad.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("cannot run bad"));
        assert_eq!(orch.worker("ws-1").await.status, WorkerStatus::Idle);

        // The queue is not stuck behind the failure.
        orch.start("ws-1").await.unwrap();
        assert_eq!(orch.worker("ws-1").await.status, WorkerStatus::Running);
    }

    #[tokio::test]
    async fn stop_demotes_to_pending_for_retry() {
        let (store, orch, _dir) = setup(ScriptedRunner::default());
        let task = store.create("ws-1", "t", "").unwrap();

        orch.start("ws-1").await.unwrap();
        orch.stop("ws-1").await.unwrap();

        assert_eq!(orch.worker("ws-1").await.status, WorkerStatus::Idle);
        assert_eq!(store.get(&task.id).unwrap().status, TaskStatus::Pending);

        // Stopping an idle worker is rejected.
        assert!(orch.stop("ws-1").await.is_err());

        // And the same task can start again.
        let restarted = orch.start("ws-1").await.unwrap().unwrap();
        assert_eq!(restarted.id, task.id);
    }

    #[tokio::test]
    async fn workspaces_schedule_independently() {
        let (store, orch, _dir) = setup(ScriptedRunner::default());
        store.create("ws-1", "one", "").unwrap();
        store.create("ws-2", "two", "").unwrap();

        orch.start("ws-1").await.unwrap();
        assert!(orch.can_start("ws-2").await);
        orch.start("ws-2").await.unwrap();

        assert_eq!(orch.worker("ws-1").await.status, WorkerStatus::Running);
        assert_eq!(orch.worker("ws-2").await.status, WorkerStatus::Running);
    }
}
