//! Email dispatch jobs.

use std::collections::BTreeMap;

use conveyor_job_queue::{async_trait, JobContext, JobProcessor, ProcessError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::JobError;

/// Payload of `send-email` jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: String,
    pub subject: String,
    /// Body with `{{ name }}` placeholders.
    pub template: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

/// Fill `{{ name }}` placeholders from `context`. Strings are inserted
/// verbatim, other values as JSON.
pub fn render_template(
    template: &str,
    context: &BTreeMap<String, Value>,
) -> Result<String, JobError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| JobError::Template("unclosed `{{`".to_owned()))?;
        let key = after[..end].trim();
        match context.get(key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => return Err(JobError::Template(format!("no value for `{key}`"))),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

impl EmailPayload {
    pub fn render(&self) -> Result<RenderedEmail, JobError> {
        Ok(RenderedEmail {
            subject: render_template(&self.subject, &self.context)?,
            body: render_template(&self.template, &self.context)?,
        })
    }
}

fn validate_recipient(to: &str) -> Result<(), JobError> {
    let valid = match to.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.contains('@'),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(JobError::InvalidRecipient(to.to_owned()))
    }
}

/// Renders and "sends" an email. Delivery is a log line.
#[derive(Debug, Clone)]
pub struct EmailProcessor {
    from: String,
}

impl Default for EmailProcessor {
    fn default() -> Self {
        Self::new("noreply@localhost")
    }
}

impl EmailProcessor {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

#[async_trait]
impl JobProcessor for EmailProcessor {
    async fn process(&self, ctx: JobContext) -> Result<Value, ProcessError> {
        let payload: EmailPayload = ctx.data()?;
        validate_recipient(&payload.to)?;
        let rendered = payload.render()?;
        ctx.set_progress(50);

        if ctx.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        let message_id = Uuid::new_v4();
        info!(
            job_id = %ctx.id(),
            from = %self.from,
            to = %payload.to,
            subject = %rendered.subject,
            body_len = rendered.body.len(),
            %message_id,
            "email sent"
        );
        Ok(json!({ "to": payload.to, "messageId": message_id }))
    }
}
