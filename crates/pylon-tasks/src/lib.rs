//! Workspace, task, and worker orchestration.
//!
//! - `WorkspaceStore` - workspaces with nested conversations (desks)
//! - `TaskStore` - durable FIFO task queue, one file per task
//! - `Orchestrator` - single-active-worker-per-workspace scheduler

pub mod task_store;
pub mod worker;
pub mod workspace_store;

pub use task_store::{Task, TaskError, TaskStatus, TaskStore};
pub use worker::{Orchestrator, TaskRunner, WorkerState, WorkerStatus};
pub use workspace_store::{Conversation, DeskSummary, Workspace, WorkspaceStore};
