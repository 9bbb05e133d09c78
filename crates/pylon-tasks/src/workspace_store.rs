//! Workspace and conversation (desk) registry.
//!
//! One JSON document at `<root>/workspaces.json` holds every workspace
//! with its nested conversations plus the process-wide active pair.
//! Mutations mark the store dirty and arm a debounced flush; the store
//! is the single writer of its file.

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pylon_core::{Debouncer, StoreError, now_millis};

const FLUSH_DELAY: Duration = Duration::from_millis(500);

/// One agent interaction thread (a desk) within a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub name: String,
    /// Continuation token of the most recent agent session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub unread: bool,
    /// Desk-level permission mode override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    pub created_at: i64,
}

/// A working-directory-scoped container of conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub working_dir: String,
    pub conversations: Vec<Conversation>,
    pub created_at: i64,
}

/// Flattened desk view served to `desk_list` callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeskSummary {
    pub desk_id: String,
    pub name: String,
    pub workspace_id: String,
    pub working_dir: String,
    pub status: String,
    pub unread: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Persisted {
    workspaces: Vec<Workspace>,
    /// Active `(workspaceId, conversationId)` pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active: Option<(String, String)>,
}

/// Workspace registry with debounced persistence.
pub struct WorkspaceStore {
    inner: Arc<RwLock<Persisted>>,
    debouncer: Debouncer,
}

impl WorkspaceStore {
    /// Open the registry rooted at `root`, loading `workspaces.json` if
    /// present.
    ///
    /// # Errors
    /// Returns error if the root directory cannot be created or the
    /// existing file cannot be parsed.
    pub fn open(root: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&root)?;
        let path = root.join("workspaces.json");

        let persisted = if path.exists() {
            serde_json::from_slice(&std::fs::read(&path)?)?
        } else {
            Persisted::default()
        };

        let inner = Arc::new(RwLock::new(persisted));
        let flush_inner = Arc::clone(&inner);
        let debouncer = Debouncer::new(
            FLUSH_DELAY,
            Arc::new(move || flush(&flush_inner, &path)),
        );

        Ok(Self { inner, debouncer })
    }

    /// Find a workspace by working directory, or create one.
    pub fn ensure_workspace(&self, name: &str, working_dir: &str) -> Workspace {
        {
            let inner = self.inner.read().unwrap();
            if let Some(ws) = inner.workspaces.iter().find(|w| w.working_dir == working_dir) {
                return ws.clone();
            }
        }

        let workspace = Workspace {
            id: format!("ws-{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            working_dir: working_dir.to_string(),
            conversations: Vec::new(),
            created_at: now_millis(),
        };
        self.inner.write().unwrap().workspaces.push(workspace.clone());
        self.debouncer.arm();
        workspace
    }

    /// Append a new idle conversation to a workspace and make it active.
    ///
    /// Returns `None` if the workspace does not exist.
    pub fn add_conversation(&self, workspace_id: &str, name: &str) -> Option<Conversation> {
        let conversation = Conversation {
            id: format!("desk-{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            claude_session_id: None,
            status: "idle".to_string(),
            unread: false,
            permission_mode: None,
            created_at: now_millis(),
        };

        {
            let mut inner = self.inner.write().unwrap();
            let ws = inner.workspaces.iter_mut().find(|w| w.id == workspace_id)?;
            ws.conversations.push(conversation.clone());
            inner.active = Some((workspace_id.to_string(), conversation.id.clone()));
        }
        self.debouncer.arm();
        Some(conversation)
    }

    /// The active `(workspaceId, conversationId)` pair.
    #[must_use]
    pub fn active(&self) -> Option<(String, String)> {
        self.inner.read().unwrap().active.clone()
    }

    /// Set the active pair; both ids must refer to an existing desk.
    pub fn set_active(&self, workspace_id: &str, conversation_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let valid = inner.workspaces.iter().any(|w| {
            w.id == workspace_id && w.conversations.iter().any(|c| c.id == conversation_id)
        });
        if valid {
            inner.active = Some((workspace_id.to_string(), conversation_id.to_string()));
            drop(inner);
            self.debouncer.arm();
        }
        valid
    }

    /// Mutate one conversation by desk id. Returns whether it was found.
    pub fn update_conversation(
        &self,
        conversation_id: &str,
        apply: impl FnOnce(&mut Conversation),
    ) -> bool {
        let mut inner = self.inner.write().unwrap();
        let Some(conv) = inner
            .workspaces
            .iter_mut()
            .flat_map(|w| w.conversations.iter_mut())
            .find(|c| c.id == conversation_id)
        else {
            return false;
        };
        apply(conv);
        drop(inner);
        self.debouncer.arm();
        true
    }

    /// Look up a workspace by id.
    #[must_use]
    pub fn workspace(&self, workspace_id: &str) -> Option<Workspace> {
        self.inner
            .read()
            .unwrap()
            .workspaces
            .iter()
            .find(|w| w.id == workspace_id)
            .cloned()
    }

    /// The workspace owning a desk, if any.
    #[must_use]
    pub fn workspace_of(&self, conversation_id: &str) -> Option<Workspace> {
        self.inner
            .read()
            .unwrap()
            .workspaces
            .iter()
            .find(|w| w.conversations.iter().any(|c| c.id == conversation_id))
            .cloned()
    }

    /// Flattened view of every desk across all workspaces.
    #[must_use]
    pub fn desk_list(&self) -> Vec<DeskSummary> {
        self.inner
            .read()
            .unwrap()
            .workspaces
            .iter()
            .flat_map(|w| {
                w.conversations.iter().map(|c| DeskSummary {
                    desk_id: c.id.clone(),
                    name: c.name.clone(),
                    workspace_id: w.id.clone(),
                    working_dir: w.working_dir.clone(),
                    status: c.status.clone(),
                    unread: c.unread,
                })
            })
            .collect()
    }

    /// Flush pending changes immediately; used on shutdown.
    pub fn flush(&self) {
        self.debouncer.flush_now();
    }
}

fn flush(inner: &Arc<RwLock<Persisted>>, path: &PathBuf) {
    let bytes = {
        let inner = inner.read().unwrap();
        serde_json::to_vec_pretty(&*inner)
    };
    match bytes {
        Ok(bytes) => {
            if let Err(e) = std::fs::write(path, bytes) {
                tracing::warn!("Failed to flush workspace registry {}: {e}", path.display());
            }
        }
        Err(e) => tracing::warn!("Failed to serialize workspace registry: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_workspace_is_idempotent_per_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::open(dir.path().to_path_buf()).unwrap();

        let a = store.ensure_workspace("Demo", "/tmp/demo");
        let b = store.ensure_workspace("Other name", "/tmp/demo");
        assert_eq!(a.id, b.id);

        let c = store.ensure_workspace("Demo2", "/tmp/demo2");
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn new_conversation_starts_idle_and_becomes_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::open(dir.path().to_path_buf()).unwrap();

        let ws = store.ensure_workspace("Demo", "/tmp/demo");
        let conv = store.add_conversation(&ws.id, "Demo").unwrap();

        assert_eq!(conv.status, "idle");
        assert_eq!(store.active(), Some((ws.id.clone(), conv.id.clone())));

        let desks = store.desk_list();
        assert_eq!(desks.len(), 1);
        assert_eq!(desks[0].desk_id, conv.id);
        assert_eq!(desks[0].status, "idle");
        assert!(!desks[0].unread);
    }

    #[tokio::test]
    async fn update_conversation_mutates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::open(dir.path().to_path_buf()).unwrap();
        let ws = store.ensure_workspace("Demo", "/tmp/demo");
        let conv = store.add_conversation(&ws.id, "Demo").unwrap();

        assert!(store.update_conversation(&conv.id, |c| {
            c.status = "working".to_string();
            c.unread = true;
            c.claude_session_id = Some("sess-1".to_string());
        }));
        let desk = &store.desk_list()[0];
        assert_eq!(desk.status, "working");
        assert!(desk.unread);

        assert!(!store.update_conversation("desk-missing", |_| {}));
    }

    #[tokio::test]
    async fn flush_persists_and_reopen_restores() {
        let dir = tempfile::tempdir().unwrap();
        let (ws_id, conv_id) = {
            let store = WorkspaceStore::open(dir.path().to_path_buf()).unwrap();
            let ws = store.ensure_workspace("Demo", "/tmp/demo");
            let conv = store.add_conversation(&ws.id, "Demo").unwrap();
            store.flush();
            (ws.id, conv.id)
        };

        let reopened = WorkspaceStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.active(), Some((ws_id.clone(), conv_id)));
        assert_eq!(reopened.desk_list().len(), 1);
        assert_eq!(reopened.workspace_of(&reopened.desk_list()[0].desk_id).unwrap().id, ws_id);
    }
}
