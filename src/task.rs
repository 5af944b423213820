//! The queue of book jobs and their status state machine.
//!
//! Every status change in the app flows through [`TaskQueue::update`]; the
//! presentation side only ever observes snapshots. Subscribers are invoked
//! after the task lock is released so a callback may re-enter the queue.

use crate::metadata::BookMetadata;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Converting,
    Converted,
    Transferring,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Legal edges of the task state machine.
    ///
    /// `Queued -> Transferring` does not appear because even the compound
    /// "convert then send" flow passes through `Converting` first.
    /// `Converted -> Queued` is the explicit demotion used when a cached
    /// artifact is in the wrong container format, `Converted -> Completed`
    /// is the local save-to-folder completion, `Converted -> Failed` covers
    /// a post-conversion step going wrong (saving the artifact, starting a
    /// transfer), and `Failed -> Queued` is the explicit user retry.
    pub fn can_transition(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Converting)
                | (Converting, Converted)
                | (Converting, Failed)
                | (Converted, Transferring)
                | (Converted, Queued)
                | (Converted, Completed)
                | (Converted, Failed)
                | (Transferring, Completed)
                | (Transferring, Failed)
                | (Failed, Queued)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Converting => "converting",
            TaskStatus::Converted => "converted",
            TaskStatus::Transferring => "transferring",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One book's journey from source file to converted/transferred artifact.
#[derive(Debug, Clone)]
pub struct BookTask {
    pub id: String,
    pub metadata: BookMetadata,
    /// Target container format; meaningful to edit only while `Queued`.
    pub output_format: String,
    pub status: TaskStatus,
    /// 0-100, meaningful while `Converting` or `Transferring`.
    pub progress: f32,
    /// Set once a conversion succeeds; never cleared afterwards so a retry
    /// can reuse the artifact.
    pub converted_path: Option<PathBuf>,
    pub cover_path: Option<PathBuf>,
    /// Identifier the converter embeds into the output's metadata; required
    /// to name the device thumbnail.
    pub device_asin: Option<String>,
    pub error_message: String,
}

impl BookTask {
    pub fn new(metadata: BookMetadata, output_format: impl Into<String>) -> Self {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            id,
            metadata,
            output_format: output_format.into(),
            status: TaskStatus::Queued,
            progress: 0.0,
            converted_path: None,
            cover_path: None,
            device_asin: None,
            error_message: String::new(),
        }
    }

    fn apply(&mut self, update: TaskUpdate) {
        if let Some(status) = update.status {
            if !self.status.can_transition(status) {
                warn!(
                    id = %self.id,
                    from = %self.status,
                    to = %status,
                    "Ignoring illegal status transition"
                );
            } else {
                self.status = status;
                // Any successful transition implicitly clears a stale error.
                if status != TaskStatus::Failed {
                    self.error_message.clear();
                }
            }
        }
        if let Some(progress) = update.progress {
            self.progress = progress.clamp(0.0, 100.0);
        }
        if let Some(format) = update.output_format {
            self.output_format = format;
        }
        if let Some(path) = update.converted_path {
            self.converted_path = Some(path);
        }
        if let Some(path) = update.cover_path {
            self.cover_path = Some(path);
        }
        if let Some(asin) = update.device_asin {
            self.device_asin = Some(asin);
        }
        if let Some(message) = update.error_message {
            self.error_message = message;
        }
    }
}

/// Partial field update applied under the queue lock. Only the fields that
/// are `Some` are touched, so the mutable surface of a task is exactly this
/// struct.
#[derive(Debug, Default, Clone)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<f32>,
    pub output_format: Option<String>,
    pub converted_path: Option<PathBuf>,
    pub cover_path: Option<PathBuf>,
    pub device_asin: Option<String>,
    pub error_message: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: f32) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }
}

type Subscriber = Arc<dyn Fn() + Send + Sync>;

/// Ordered collection of [`BookTask`]s shared between the coordinating
/// thread and background workers.
#[derive(Default)]
pub struct TaskQueue {
    tasks: Mutex<Vec<BookTask>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a "something changed" callback. Callbacks run on whichever
    /// thread performed the mutation and must marshal to the UI themselves.
    pub fn subscribe(&self, subscriber: impl Fn() + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(Arc::new(subscriber));
    }

    fn notify(&self) {
        let snapshot: Vec<Subscriber> = self
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .clone();
        for subscriber in snapshot {
            subscriber();
        }
    }

    pub fn add(&self, task: BookTask) {
        debug!(id = %task.id, title = %task.metadata.title, "Queueing task");
        self.tasks.lock().expect("task lock poisoned").push(task);
        self.notify();
    }

    /// Permanent deletion; a no-op if the id is absent.
    pub fn remove(&self, id: &str) {
        self.tasks
            .lock()
            .expect("task lock poisoned")
            .retain(|t| t.id != id);
        self.notify();
    }

    pub fn get(&self, id: &str) -> Option<BookTask> {
        self.tasks
            .lock()
            .expect("task lock poisoned")
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    /// Apply a partial update; a no-op if the id is absent (e.g. the task
    /// was removed while a background operation was in flight).
    pub fn update(&self, id: &str, update: TaskUpdate) {
        {
            let mut tasks = self.tasks.lock().expect("task lock poisoned");
            match tasks.iter_mut().find(|t| t.id == id) {
                Some(task) => task.apply(update),
                None => {
                    debug!(id, "Update for unknown task ignored");
                    return;
                }
            }
        }
        self.notify();
    }

    /// Snapshot copy, safe to iterate without holding the lock.
    pub fn list_all(&self) -> Vec<BookTask> {
        self.tasks.lock().expect("task lock poisoned").clone()
    }

    pub fn list_queued(&self) -> Vec<BookTask> {
        self.tasks
            .lock()
            .expect("task lock poisoned")
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("task lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every task that finished, successfully or not.
    pub fn clear_terminal(&self) {
        self.tasks
            .lock()
            .expect("task lock poisoned")
            .retain(|t| !t.status.is_terminal());
        self.notify();
    }
}
