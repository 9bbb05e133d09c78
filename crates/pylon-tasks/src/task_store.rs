//! Durable per-workspace task queue.
//!
//! One JSON file per task under `<root>/tasks/`. Task ids encode
//! creation time, so lexicographic id order is creation order; a short
//! random suffix breaks same-millisecond ties. Tasks are mutated only
//! through status transitions and never deleted automatically.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::RwLock,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use pylon_core::now_millis;

/// Task operation error. Failed operations never mutate state.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task {0} not found")]
    NotFound(String),
    #[error("Task {id} is {actual}, expected {expected}")]
    InvalidStatus {
        id: String,
        expected: TaskStatus,
        actual: TaskStatus,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One queued unit of work: a metadata block plus a free-form body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub workspace_id: String,
    pub title: String,
    /// Free-form instruction text handed to the session on start.
    #[serde(default)]
    pub body: String,
    pub status: TaskStatus,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Durable task queue; the single writer of its task files.
pub struct TaskStore {
    dir: PathBuf,
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskStore {
    /// Open a store rooted at `root`, loading persisted tasks from
    /// `<root>/tasks/`.
    ///
    /// # Errors
    /// Returns error if the tasks directory cannot be created or read.
    pub fn open(root: PathBuf) -> Result<Self, TaskError> {
        let dir = root.join("tasks");
        std::fs::create_dir_all(&dir)?;

        let mut tasks = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            match std::fs::read(&path)
                .map_err(TaskError::from)
                .and_then(|b| serde_json::from_slice::<Task>(&b).map_err(Into::into))
            {
                Ok(task) => {
                    tasks.insert(task.id.clone(), task);
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable task file {}: {e}", path.display());
                }
            }
        }

        Ok(Self {
            dir,
            tasks: RwLock::new(tasks),
        })
    }

    /// Create a pending task and persist it.
    ///
    /// # Errors
    /// Returns error if the task file cannot be written.
    pub fn create(
        &self,
        workspace_id: &str,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Task, TaskError> {
        let created_at = now_millis();
        let suffix = &Uuid::new_v4().simple().to_string()[..4];
        let task = Task {
            id: format!("task-{created_at}-{suffix}"),
            workspace_id: workspace_id.to_string(),
            title: title.into(),
            body: body.into(),
            status: TaskStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            error: None,
        };

        self.write_file(&task)?;
        self.tasks.write().unwrap().insert(task.id.clone(), task.clone());
        Ok(task)
    }

    /// Look up a task by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().unwrap().get(id).cloned()
    }

    /// All tasks for a workspace in creation order.
    #[must_use]
    pub fn list(&self, workspace_id: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .unwrap()
            .values()
            .filter(|t| t.workspace_id == workspace_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// The oldest pending task for a workspace, if any.
    #[must_use]
    pub fn next_pending(&self, workspace_id: &str) -> Option<Task> {
        self.list(workspace_id)
            .into_iter()
            .find(|t| t.status == TaskStatus::Pending)
    }

    /// Transition a pending task to running and stamp `startedAt`.
    ///
    /// # Errors
    /// Returns `NotFound` or `InvalidStatus`; neither mutates state.
    pub fn mark_running(&self, id: &str) -> Result<Task, TaskError> {
        self.transition(id, TaskStatus::Pending, |task| {
            task.status = TaskStatus::Running;
            task.started_at = Some(now_millis());
        })
    }

    /// Transition a running task to a terminal status and stamp
    /// `completedAt`.
    ///
    /// # Errors
    /// Returns `NotFound` or `InvalidStatus`; neither mutates state.
    pub fn mark_complete(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Task, TaskError> {
        self.transition(id, TaskStatus::Running, |task| {
            task.status = status;
            task.completed_at = Some(now_millis());
            task.error = error;
        })
    }

    /// Demote a running task back to pending, enabling a retry.
    ///
    /// # Errors
    /// Returns `NotFound` or `InvalidStatus`; neither mutates state.
    pub fn demote(&self, id: &str) -> Result<Task, TaskError> {
        self.transition(id, TaskStatus::Running, |task| {
            task.status = TaskStatus::Pending;
            task.started_at = None;
            task.error = None;
        })
    }

    fn transition(
        &self,
        id: &str,
        expected: TaskStatus,
        apply: impl FnOnce(&mut Task),
    ) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if task.status != expected {
            return Err(TaskError::InvalidStatus {
                id: id.to_string(),
                expected,
                actual: task.status,
            });
        }
        apply(task);
        let snapshot = task.clone();
        drop(tasks);

        self.write_file(&snapshot)?;
        Ok(snapshot)
    }

    fn write_file(&self, task: &Task) -> Result<(), TaskError> {
        let path = self.dir.join(format!("{}.json", task.id));
        std::fs::write(&path, serde_json::to_vec_pretty(task)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().to_path_buf()).unwrap();

        let a = store.create("ws-1", "first", "").unwrap();
        let b = store.create("ws-1", "second", "").unwrap();
        let c = store.create("ws-1", "third", "").unwrap();

        let listed: Vec<String> = store.list("ws-1").into_iter().map(|t| t.id).collect();
        let mut expected = vec![a.id, b.id, c.id];
        expected.sort();
        assert_eq!(listed, expected);
        assert_eq!(store.next_pending("ws-1").unwrap().title, "first");
    }

    #[test]
    fn invalid_transitions_do_not_mutate() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().to_path_buf()).unwrap();
        let task = store.create("ws-1", "t", "").unwrap();

        // Completing a pending task is rejected.
        let err = store
            .mark_complete(&task.id, TaskStatus::Done, None)
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidStatus { .. }));
        assert_eq!(store.get(&task.id).unwrap().status, TaskStatus::Pending);

        assert!(matches!(
            store.mark_running("task-0-zzzz").unwrap_err(),
            TaskError::NotFound(_)
        ));
    }

    #[test]
    fn lifecycle_stamps_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().to_path_buf()).unwrap();
        let task = store.create("ws-1", "t", "do the thing").unwrap();

        let running = store.mark_running(&task.id).unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());

        let done = store
            .mark_complete(&task.id, TaskStatus::Done, None)
            .unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn demote_enables_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().to_path_buf()).unwrap();
        let task = store.create("ws-1", "t", "").unwrap();

        store.mark_running(&task.id).unwrap();
        let demoted = store.demote(&task.id).unwrap();
        assert_eq!(demoted.status, TaskStatus::Pending);
        assert!(demoted.started_at.is_none());
        assert_eq!(store.next_pending("ws-1").unwrap().id, task.id);
    }

    #[test]
    fn reopen_restores_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = TaskStore::open(dir.path().to_path_buf()).unwrap();
            let task = store.create("ws-1", "persisted", "body text").unwrap();
            store.mark_running(&task.id).unwrap();
            task.id
        };

        let reopened = TaskStore::open(dir.path().to_path_buf()).unwrap();
        let task = reopened.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.body, "body text");
    }
}
