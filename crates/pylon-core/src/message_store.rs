//! Capped per-session message log with debounced persistence.
//!
//! Each session owns an ordered log of chat/tool/result/error records,
//! cached in memory and flushed to one JSON file per session on a
//! debounce timer or an explicit flush. The store is the single writer
//! of its backing files.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{Debouncer, now_millis};

/// Maximum retained records per session.
const DEFAULT_CAP: usize = 1000;

/// Quiet period before a flush.
const FLUSH_DELAY: Duration = Duration::from_millis(500);

/// Store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One persisted log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    /// Unix millis at append time.
    pub at: i64,
    /// Record kind: chat, tool, result, error, or an outward event name.
    pub kind: String,
    pub data: Value,
}

struct Inner {
    sessions: HashMap<String, VecDeque<StoredMessage>>,
    dirty: HashSet<String>,
}

/// Per-session message log.
pub struct MessageStore {
    inner: Arc<RwLock<Inner>>,
    root: PathBuf,
    cap: usize,
    debouncer: Debouncer,
}

impl MessageStore {
    /// Open a store rooted at `root`, loading any persisted session logs.
    ///
    /// # Errors
    /// Returns error if the root directory cannot be created.
    pub fn open(root: PathBuf) -> Result<Self, StoreError> {
        Self::open_with_cap(root, DEFAULT_CAP)
    }

    /// Open a store with an explicit retention cap.
    ///
    /// # Errors
    /// Returns error if the root directory cannot be created.
    pub fn open_with_cap(root: PathBuf, cap: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&root)?;

        let mut sessions = HashMap::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|b| serde_json::from_slice::<Vec<StoredMessage>>(&b).map_err(Into::into))
            {
                Ok(records) => {
                    sessions.insert(session_id.to_string(), records.into_iter().collect());
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable message log {}: {e}", path.display());
                }
            }
        }

        let inner = Arc::new(RwLock::new(Inner {
            sessions,
            dirty: HashSet::new(),
        }));

        let flush_inner = Arc::clone(&inner);
        let flush_root = root.clone();
        let debouncer = Debouncer::new(
            FLUSH_DELAY,
            Arc::new(move || flush_dirty(&flush_inner, &flush_root)),
        );

        Ok(Self {
            inner,
            root,
            cap,
            debouncer,
        })
    }

    /// Append a record to a session's log, evicting the oldest past the cap.
    pub fn append(&self, session_id: &str, kind: impl Into<String>, data: Value) -> StoredMessage {
        let record = StoredMessage {
            id: Uuid::new_v4().to_string(),
            at: now_millis(),
            kind: kind.into(),
            data,
        };

        {
            let mut inner = self.inner.write().unwrap();
            let log = inner.sessions.entry(session_id.to_string()).or_default();
            log.push_back(record.clone());
            while log.len() > self.cap {
                log.pop_front();
            }
            inner.dirty.insert(session_id.to_string());
        }

        self.debouncer.arm();
        record
    }

    /// Snapshot of a session's log, oldest first.
    #[must_use]
    pub fn history(&self, session_id: &str) -> Vec<StoredMessage> {
        self.inner
            .read()
            .unwrap()
            .sessions
            .get(session_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Flush all dirty sessions immediately; used on shutdown.
    pub fn flush(&self) {
        self.debouncer.flush_now();
    }

    /// Storage root directory.
    #[must_use]
    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

fn flush_dirty(inner: &Arc<RwLock<Inner>>, root: &PathBuf) {
    let to_write: Vec<(String, Vec<StoredMessage>)> = {
        let mut inner = inner.write().unwrap();
        let dirty: Vec<String> = inner.dirty.drain().collect();
        dirty
            .into_iter()
            .filter_map(|id| {
                inner
                    .sessions
                    .get(&id)
                    .map(|log| (id, log.iter().cloned().collect()))
            })
            .collect()
    };

    for (session_id, records) in to_write {
        let path = root.join(format!("{session_id}.json"));
        match serde_json::to_vec(&records) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!("Failed to flush message log {}: {e}", path.display());
                }
            }
            Err(e) => tracing::warn!("Failed to serialize message log {session_id}: {e}"),
        }
    }
}
