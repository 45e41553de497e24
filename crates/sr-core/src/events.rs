//! Broadcast event bus for engine observers.
//!
//! Emission is fire-and-forget: the engine never blocks on (or depends on
//! the presence of) subscribers. Reporting and UI layers subscribe and drain
//! at their own pace.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EngineEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskStarted {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: String,
        commit: Option<String>,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        task_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    TaskSkipped {
        task_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    WorktreeCreated {
        task_id: String,
        path: String,
        branch: String,
        timestamp: DateTime<Utc>,
    },
    BranchCreated {
        task_id: String,
        branch: String,
        parent: String,
        timestamp: DateTime<Utc>,
    },
    StackBuilt {
        branches: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    ConflictDetected {
        task_id: String,
        files: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    ConflictResolved {
        task_id: String,
        resolution: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn task_started(task_id: impl Into<String>) -> Self {
        EngineEvent::TaskStarted {
            task_id: task_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn task_completed(task_id: impl Into<String>, commit: Option<String>) -> Self {
        EngineEvent::TaskCompleted {
            task_id: task_id.into(),
            commit,
            timestamp: Utc::now(),
        }
    }

    pub fn task_failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        EngineEvent::TaskFailed {
            task_id: task_id.into(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn task_skipped(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineEvent::TaskSkipped {
            task_id: task_id.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn worktree_created(
        task_id: impl Into<String>,
        path: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        EngineEvent::WorktreeCreated {
            task_id: task_id.into(),
            path: path.into(),
            branch: branch.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn branch_created(
        task_id: impl Into<String>,
        branch: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        EngineEvent::BranchCreated {
            task_id: task_id.into(),
            branch: branch.into(),
            parent: parent.into(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A broadcast-style event bus built on flume channels.
///
/// Each call to [`subscribe`](EventBus::subscribe) creates a new receiver
/// that will receive all events published after the subscription was created.
/// The bus is thread-safe and cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish an event to all current subscribers. Disconnected subscribers
    /// are pruned.
    pub fn publish(&self, event: EngineEvent) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
