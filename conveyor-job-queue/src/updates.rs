//! In-process notification of job changes.
//!
//! Only the process that owns a running execution publishes here. Observers in
//! other processes fall back to polling the stored record.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::types::{Job, JobId};

const DEFAULT_CAPACITY: usize = 256;

/// A change observed for a job.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Progress { id: JobId, progress: u8 },
    Changed(Job),
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Progress { id, .. } => *id,
            Self::Changed(job) => job.id,
        }
    }
}

/// Most aliases kept; the oldest are forgotten first.
pub(crate) const MAX_ALIASES: usize = 10_000;

#[derive(Debug, Default)]
struct Registry {
    aliases: HashMap<JobId, JobId>,
    /// Alias sources, oldest first.
    order: VecDeque<JobId>,
    /// Jobs sitting in a buffer that have no stored record yet.
    held: HashSet<JobId>,
}

impl Registry {
    fn resolve(&self, id: JobId) -> JobId {
        let mut current = id;
        // Bounded walk; alias chains are short and never cyclic.
        for _ in 0..self.aliases.len() {
            match self.aliases.get(&current) {
                Some(next) => current = *next,
                None => break,
            }
        }
        current
    }
}

/// Broadcast hub for [`JobEvent`]s plus the bookkeeping handles need for jobs
/// that are buffered or were collapsed into another job.
#[derive(Debug, Clone)]
pub struct JobUpdates {
    tx: broadcast::Sender<JobEvent>,
    registry: Arc<Mutex<Registry>>,
    max_aliases: usize,
}

impl Default for JobUpdates {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl JobUpdates {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            registry: Arc::new(Mutex::new(Registry::default())),
            max_aliases: MAX_ALIASES,
        }
    }

    #[cfg(test)]
    fn with_max_aliases(mut self, max_aliases: usize) -> Self {
        self.max_aliases = max_aliases.max(1);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn publish_progress(&self, id: JobId, progress: u8) {
        // No receivers is not an error.
        let _ = self.tx.send(JobEvent::Progress { id, progress });
    }

    pub fn publish_changed(&self, job: &Job) {
        let _ = self.tx.send(JobEvent::Changed(job.clone()));
    }

    /// Record that `from` was collapsed into `to`. `from` is no longer held.
    pub fn alias(&self, from: JobId, to: JobId) {
        let mut registry = self.lock();
        registry.held.remove(&from);
        if from == to {
            return;
        }
        if registry.aliases.insert(from, to).is_none() {
            registry.order.push_back(from);
        }
        while registry.order.len() > self.max_aliases {
            if let Some(oldest) = registry.order.pop_front() {
                registry.aliases.remove(&oldest);
            }
        }
    }

    /// Follow aliases to the id of the record that actually carries the work.
    pub fn resolve(&self, id: JobId) -> JobId {
        self.lock().resolve(id)
    }

    /// [`resolve`](Self::resolve) plus whether the resolved job is still
    /// buffered, read together.
    pub(crate) fn resolve_held(&self, id: JobId) -> (JobId, bool) {
        let registry = self.lock();
        let target = registry.resolve(id);
        (target, registry.held.contains(&target))
    }

    /// Mark a job as buffered without a stored record.
    pub(crate) fn hold(&self, id: JobId) {
        self.lock().held.insert(id);
    }

    /// The job left its buffer: it was stored or dropped.
    pub(crate) fn release(&self, id: JobId) {
        self.lock().held.remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
