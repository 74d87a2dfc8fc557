//! Requests the server sends to workers over the process bridge.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use conveyor_job_queue::bridge::{BridgeRequest, BridgeRouter};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::email::{EmailPayload, RenderedEmail};

/// Liveness check answered by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPing {
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPong {
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub pid: u32,
}

impl BridgeRequest for WorkerPing {
    const TAG: &'static str = "worker.ping";
    type Response = WorkerPong;
}

/// Render an email on the worker without sending it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderEmailPreview {
    pub subject: String,
    pub template: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl BridgeRequest for RenderEmailPreview {
    const TAG: &'static str = "email.render-preview";
    type Response = RenderedEmail;
}

/// Router with every handler a worker answers.
pub fn bridge_router() -> BridgeRouter {
    BridgeRouter::new()
        .route_typed(|ping: WorkerPing| async move {
            Ok(WorkerPong {
                sent_at: ping.sent_at,
                received_at: Utc::now(),
                pid: std::process::id(),
            })
        })
        .route_typed(|preview: RenderEmailPreview| async move {
            let payload = EmailPayload {
                to: String::new(),
                subject: preview.subject,
                template: preview.template,
                context: preview.context,
            };
            payload.render().map_err(|err| err.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_job_queue::bridge::{BridgeError, ProcessBridge};
    use conveyor_job_queue::ProcessRole;
    use serde_json::json;

    #[tokio::test]
    async fn worker_answers_pings_and_previews() {
        let bridge = ProcessBridge::local(ProcessRole::Server, bridge_router());

        let sent_at = Utc::now();
        let pong = bridge.request(&WorkerPing { sent_at }).await.unwrap();
        assert_eq!(pong.sent_at, sent_at);
        assert_eq!(pong.pid, std::process::id());

        let preview = RenderEmailPreview {
            subject: "Hello {{ name }}".into(),
            template: "Body".into(),
            context: [("name".to_owned(), json!("Ada"))].into_iter().collect(),
        };
        let rendered = bridge.request(&preview).await.unwrap();
        assert_eq!(rendered.subject, "Hello Ada");
    }

    #[tokio::test]
    async fn template_errors_come_back_as_remote_errors() {
        let bridge = ProcessBridge::local(ProcessRole::Server, bridge_router());
        let preview = RenderEmailPreview {
            subject: "{{ missing }}".into(),
            template: String::new(),
            context: BTreeMap::new(),
        };
        let err = bridge.request(&preview).await.unwrap_err();
        assert!(matches!(err, BridgeError::Remote { tag, .. } if tag == RenderEmailPreview::TAG));
    }
}
