//! Search index refresh jobs.

use std::collections::HashSet;

use conveyor_job_queue::{async_trait, Job, JobBuffer, JobContext, JobProcessor, ProcessError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::job_types;

/// A document whose index entry needs refreshing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub kind: String,
    pub id: String,
}

impl DocumentRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// Payload of `update-search-index` jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchIndexPayload {
    pub documents: Vec<DocumentRef>,
}

/// Re-indexes every document of a job, reporting progress per document.
#[derive(Debug, Default)]
pub struct SearchIndexProcessor;

impl SearchIndexProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobProcessor for SearchIndexProcessor {
    async fn process(&self, ctx: JobContext) -> Result<Value, ProcessError> {
        let payload: SearchIndexPayload = ctx.data()?;
        let total = payload.documents.len();

        info!(job_id = %ctx.id(), attempt = ctx.attempt(), documents = total, "updating search index");

        for (done, doc) in payload.documents.iter().enumerate() {
            if ctx.is_cancelled() {
                info!(job_id = %ctx.id(), indexed = done, "search index update cancelled");
                return Err(ProcessError::Cancelled);
            }
            debug!(kind = %doc.kind, id = %doc.id, "indexed document");
            ctx.set_progress(percent(done + 1, total));
        }

        Ok(json!({ "indexed": total }))
    }
}

#[inline]
fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(done.saturating_mul(100) / total).unwrap_or(100)
}

/// Merges pending index updates into one job per flush.
///
/// Updates for the same document are only indexed once. Jobs whose payload
/// does not parse are passed through untouched.
#[derive(Debug, Default)]
pub struct SearchIndexBuffer;

impl SearchIndexBuffer {
    pub const ID: &'static str = "search-index";

    pub fn new() -> Self {
        Self
    }
}

impl JobBuffer for SearchIndexBuffer {
    fn id(&self) -> &str {
        Self::ID
    }

    fn collect(&self, job: &Job) -> bool {
        job.queue_name == job_types::UPDATE_SEARCH_INDEX
    }

    fn reduce(&self, jobs: Vec<Job>) -> Vec<Job> {
        let mut merged: Option<(Job, SearchIndexPayload)> = None;
        let mut seen = HashSet::new();
        let mut passthrough = Vec::new();

        for job in jobs {
            let Ok(payload) = serde_json::from_value::<SearchIndexPayload>(job.data.clone()) else {
                passthrough.push(job);
                continue;
            };
            let (survivor, documents) = merged.get_or_insert_with(|| (job.clone(), SearchIndexPayload::default()));
            survivor.retries = survivor.retries.max(job.retries);
            for doc in payload.documents {
                if seen.insert(doc.clone()) {
                    documents.documents.push(doc);
                }
            }
        }

        let mut reduced = Vec::with_capacity(passthrough.len() + 1);
        if let Some((mut survivor, payload)) = merged {
            match serde_json::to_value(&payload) {
                Ok(data) => survivor.data = data,
                Err(err) => debug!(error = %err, "keeping original search index payload"),
            }
            reduced.push(survivor);
        }
        reduced.extend(passthrough);
        reduced
    }
}
