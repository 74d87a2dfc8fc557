//! Buffering of jobs before they reach the strategy.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::JobQueueError;
use crate::types::{Job, JobId};
use crate::updates::JobUpdates;

/// A named buffer that holds the jobs it collects until flushed.
///
/// On flush, [`reduce`](JobBuffer::reduce) may merge the collected jobs. Jobs
/// it drops are aliased to the first surviving job so their handles resolve
/// with that job's outcome. When nothing survives, their handles report the
/// job as not found.
pub trait JobBuffer: Send + Sync {
    fn id(&self) -> &str;

    /// Whether this buffer takes `job`.
    fn collect(&self, job: &Job) -> bool;

    /// Reduce the collected jobs, in the order they were added.
    fn reduce(&self, jobs: Vec<Job>) -> Vec<Job> {
        jobs
    }
}

/// Registered named buffers and the jobs they currently hold.
#[derive(Default)]
pub(crate) struct BufferSet {
    buffers: Vec<Arc<dyn JobBuffer>>,
    held: HashMap<String, Vec<Job>>,
}

impl fmt::Debug for BufferSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSet")
            .field("buffers", &self.buffers.iter().map(|b| b.id()).collect::<Vec<_>>())
            .field("held", &self.held.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl BufferSet {
    pub(crate) fn add(&mut self, buffer: Arc<dyn JobBuffer>) -> Result<(), JobQueueError> {
        if self.buffers.iter().any(|b| b.id() == buffer.id()) {
            return Err(JobQueueError::DuplicateBuffer(buffer.id().to_owned()));
        }
        self.buffers.push(buffer);
        Ok(())
    }

    /// Unregister a buffer, returning the jobs it was holding.
    pub(crate) fn remove(&mut self, id: &str) -> Option<Vec<Job>> {
        let position = self.buffers.iter().position(|b| b.id() == id)?;
        self.buffers.remove(position);
        Some(self.held.remove(id).unwrap_or_default())
    }

    /// Hold `job` in the first buffer that collects it, or hand it back.
    pub(crate) fn collect(&mut self, job: Job) -> Option<Job> {
        match self.buffers.iter().find(|b| b.collect(&job)) {
            Some(buffer) => {
                self.held.entry(buffer.id().to_owned()).or_default().push(job);
                None
            }
            None => Some(job),
        }
    }

    /// Remove a single held job.
    pub(crate) fn extract(&mut self, id: JobId) -> Option<Job> {
        self.held.values_mut().find_map(|jobs| {
            let position = jobs.iter().position(|job| job.id == id)?;
            Some(jobs.remove(position))
        })
    }

    /// Number of held jobs in the given buffers (all buffers if empty).
    pub(crate) fn size(&self, ids: &[String]) -> usize {
        self.held
            .iter()
            .filter(|(id, _)| ids.is_empty() || ids.contains(id))
            .map(|(_, jobs)| jobs.len())
            .sum()
    }

    /// Remove and reduce the jobs held by the given buffers (all if empty).
    pub(crate) fn take(&mut self, ids: &[String], updates: &JobUpdates) -> Vec<Job> {
        let mut flushed = Vec::new();
        for buffer in &self.buffers {
            if !ids.is_empty() && !ids.iter().any(|id| id == buffer.id()) {
                continue;
            }
            if let Some(jobs) = self.held.remove(buffer.id()) {
                flushed.extend(reduce_group(buffer.as_ref(), dedupe(jobs), updates));
            }
        }
        flushed
    }

    /// Collapse the startup buffer: drop repeated ids, then let each buffer
    /// reduce the jobs it collects. Survivors of a buffer take the position of
    /// its first collected job; everything else keeps its order.
    pub(crate) fn collapse(&self, jobs: Vec<Job>, updates: &JobUpdates) -> Vec<Job> {
        let jobs = dedupe(jobs);

        let mut groups: Vec<Vec<Job>> = vec![Vec::new(); self.buffers.len()];
        let mut layout: Vec<Slot> = Vec::with_capacity(jobs.len());
        let mut seen_groups = HashSet::new();
        for job in jobs {
            match self.buffers.iter().position(|b| b.collect(&job)) {
                Some(group) => {
                    if seen_groups.insert(group) {
                        layout.push(Slot::Group(group));
                    }
                    groups[group].push(job);
                }
                None => layout.push(Slot::Job(job)),
            }
        }

        let mut collapsed = Vec::with_capacity(layout.len());
        for slot in layout {
            match slot {
                Slot::Job(job) => collapsed.push(job),
                Slot::Group(group) => {
                    let jobs = std::mem::take(&mut groups[group]);
                    collapsed.extend(reduce_group(self.buffers[group].as_ref(), jobs, updates));
                }
            }
        }
        collapsed
    }
}

enum Slot {
    Job(Job),
    /// Where the survivors of a buffer's reduction go.
    Group(usize),
}

fn dedupe(jobs: Vec<Job>) -> Vec<Job> {
    let mut seen = HashSet::with_capacity(jobs.len());
    jobs.into_iter().filter(|job| seen.insert(job.id)).collect()
}

fn reduce_group(buffer: &dyn JobBuffer, jobs: Vec<Job>, updates: &JobUpdates) -> Vec<Job> {
    let ids: Vec<JobId> = jobs.iter().map(|job| job.id).collect();
    let reduced = buffer.reduce(jobs);

    let kept: HashSet<JobId> = reduced.iter().map(|job| job.id).collect();
    for id in ids.into_iter().filter(|id| !kept.contains(id)) {
        match reduced.first() {
            Some(survivor) => updates.alias(id, survivor.id),
            None => updates.release(id),
        }
    }
    tracing::debug!(buffer = buffer.id(), kept = reduced.len(), "reduced buffered jobs");
    reduced
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Keeps only the last job of its queue.
    struct LatestOnly(&'static str);

    impl JobBuffer for LatestOnly {
        fn id(&self) -> &str {
            self.0
        }

        fn collect(&self, job: &Job) -> bool {
            job.queue_name == self.0
        }

        fn reduce(&self, mut jobs: Vec<Job>) -> Vec<Job> {
            jobs.pop().into_iter().collect()
        }
    }

    fn job(queue: &str, n: i64) -> Job {
        Job::new(queue, json!(n), 0)
    }

    #[test]
    fn collapse_without_buffers_only_drops_repeated_ids() {
        let set = BufferSet::default();
        let a = job("emails", 1);
        let b = job("emails", 2);
        let jobs = vec![a.clone(), b.clone(), a.clone()];
        let collapsed = set.collapse(jobs, &JobUpdates::default());
        assert_eq!(collapsed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a.id, b.id]);
    }

    #[test]
    fn collapse_reduces_in_place_and_aliases_dropped_jobs() {
        let mut set = BufferSet::default();
        set.add(Arc::new(LatestOnly("indexing"))).unwrap();
        let updates = JobUpdates::default();

        let first = job("emails", 1);
        let idx1 = job("indexing", 2);
        let second = job("emails", 3);
        let idx2 = job("indexing", 4);
        let collapsed = set.collapse(
            vec![first.clone(), idx1.clone(), second.clone(), idx2.clone()],
            &updates,
        );

        assert_eq!(
            collapsed.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![first.id, idx2.id, second.id]
        );
        assert_eq!(updates.resolve(idx1.id), idx2.id);
    }

    #[test]
    fn held_jobs_are_flushed_per_buffer() {
        let mut set = BufferSet::default();
        set.add(Arc::new(LatestOnly("indexing"))).unwrap();
        set.add(Arc::new(LatestOnly("thumbnails"))).unwrap();
        assert!(matches!(
            set.add(Arc::new(LatestOnly("indexing"))),
            Err(JobQueueError::DuplicateBuffer(_))
        ));

        assert!(set.collect(job("emails", 0)).is_some());
        assert!(set.collect(job("indexing", 1)).is_none());
        assert!(set.collect(job("indexing", 2)).is_none());
        assert!(set.collect(job("thumbnails", 3)).is_none());
        assert_eq!(set.size(&[]), 3);
        assert_eq!(set.size(&["indexing".to_owned()]), 2);

        let flushed = set.take(&["indexing".to_owned()], &JobUpdates::default());
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].data, json!(2));
        assert_eq!(set.size(&[]), 1);

        let returned = set.remove("thumbnails").unwrap();
        assert_eq!(returned.len(), 1);
        assert_eq!(set.size(&[]), 0);
        assert!(set.remove("thumbnails").is_none());
    }
}
