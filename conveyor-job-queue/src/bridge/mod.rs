//! Request/response bridge between the server and worker processes.
//!
//! A request is a tag plus a JSON payload. The receiving side looks the tag up
//! in its [`BridgeRouter`] and replies with the handler's result. There are no
//! retries and no queueing; a failed exchange is reported to the caller.

mod tcp;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::types::ProcessRole;

pub use tcp::{serve_tcp, TcpTransport};

/// Errors returned by [`ProcessBridge`].
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no bridge handler registered for tag `{0}`")]
    UnknownTag(String),

    #[error("bridge handler for `{tag}` failed: {message}")]
    Remote { tag: String, message: String },

    #[error("bridge transport error: {0}")]
    Transport(String),

    #[error("bridge codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A typed bridge request.
pub trait BridgeRequest: Serialize + DeserializeOwned + Send + 'static {
    const TAG: &'static str;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub id: Uuid,
    pub tag: String,
    #[serde(default)]
    pub payload: Value,
}

impl BridgeMessage {
    pub fn new(tag: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            tag: tag.into(),
            payload,
        }
    }
}

/// Reply frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BridgeReply {
    Ok { id: Uuid, payload: Value },
    Error { id: Uuid, message: String },
    UnknownTag { id: Uuid, tag: String },
}

impl BridgeReply {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Ok { id, .. } | Self::Error { id, .. } | Self::UnknownTag { id, .. } => *id,
        }
    }
}

/// Handles requests for one tag.
#[async_trait]
pub trait BridgeHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<Value, String>;
}

#[async_trait]
impl<F, Fut> BridgeHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    async fn handle(&self, payload: Value) -> Result<Value, String> {
        (self)(payload).await
    }
}

struct TypedHandler<M, F> {
    handler: F,
    _message: PhantomData<fn(M)>,
}

#[async_trait]
impl<M, F, Fut> BridgeHandler for TypedHandler<M, F>
where
    M: BridgeRequest,
    F: Fn(M) -> Fut + Send + Sync,
    Fut: Future<Output = Result<M::Response, String>> + Send,
{
    async fn handle(&self, payload: Value) -> Result<Value, String> {
        let message: M =
            serde_json::from_value(payload).map_err(|e| format!("invalid payload: {e}"))?;
        let response = (self.handler)(message).await?;
        serde_json::to_value(response).map_err(|e| format!("invalid response: {e}"))
    }
}

/// Maps tags to handlers on the receiving side.
#[derive(Clone, Default)]
pub struct BridgeRouter {
    handlers: HashMap<String, Arc<dyn BridgeHandler>>,
}

impl fmt::Debug for BridgeRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeRouter")
            .field("tags", &self.tags())
            .finish()
    }
}

impl BridgeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `tag`, replacing any previous one.
    #[must_use]
    pub fn route<H>(mut self, tag: impl Into<String>, handler: H) -> Self
    where
        H: BridgeHandler + 'static,
    {
        self.handlers.insert(tag.into(), Arc::new(handler));
        self
    }

    /// Register a handler for a typed request.
    #[must_use]
    pub fn route_typed<M, F, Fut>(self, handler: F) -> Self
    where
        M: BridgeRequest,
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M::Response, String>> + Send + 'static,
    {
        self.route(
            M::TAG,
            TypedHandler {
                handler,
                _message: PhantomData,
            },
        )
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    pub async fn dispatch(&self, message: BridgeMessage) -> BridgeReply {
        let BridgeMessage { id, tag, payload } = message;
        let Some(handler) = self.handlers.get(&tag) else {
            debug!(%tag, "bridge request for unknown tag");
            return BridgeReply::UnknownTag { id, tag };
        };
        match handler.handle(payload).await {
            Ok(payload) => BridgeReply::Ok { id, payload },
            Err(message) => {
                debug!(%tag, error = %message, "bridge handler failed");
                BridgeReply::Error { id, message }
            }
        }
    }
}

/// Carries a request to the other process and returns its reply.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    async fn exchange(&self, message: BridgeMessage) -> Result<BridgeReply, BridgeError>;
}

/// In-process transport used when server and worker are the same process.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    router: Arc<BridgeRouter>,
}

impl LocalTransport {
    pub fn new(router: BridgeRouter) -> Self {
        Self {
            router: Arc::new(router),
        }
    }
}

#[async_trait]
impl BridgeTransport for LocalTransport {
    async fn exchange(&self, message: BridgeMessage) -> Result<BridgeReply, BridgeError> {
        Ok(self.router.dispatch(message).await)
    }
}

/// Sending side of the bridge.
#[derive(Clone)]
pub struct ProcessBridge {
    role: ProcessRole,
    transport: Arc<dyn BridgeTransport>,
}

impl fmt::Debug for ProcessBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessBridge")
            .field("role", &self.role)
            .finish()
    }
}

impl ProcessBridge {
    pub fn new(role: ProcessRole, transport: Arc<dyn BridgeTransport>) -> Self {
        Self { role, transport }
    }

    /// A bridge whose requests are handled by `router` in this process.
    pub fn local(role: ProcessRole, router: BridgeRouter) -> Self {
        Self::new(role, Arc::new(LocalTransport::new(router)))
    }

    #[inline]
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Send a raw request and return the handler's payload.
    pub async fn send(&self, tag: &str, payload: Value) -> Result<Value, BridgeError> {
        let message = BridgeMessage::new(tag, payload);
        let id = message.id;
        let reply = self.transport.exchange(message).await?;
        if reply.id() != id {
            return Err(BridgeError::Transport(format!(
                "reply {} does not answer request {id}",
                reply.id()
            )));
        }

        match reply {
            BridgeReply::Ok { payload, .. } => Ok(payload),
            BridgeReply::Error { message, .. } => Err(BridgeError::Remote {
                tag: tag.to_owned(),
                message,
            }),
            BridgeReply::UnknownTag { tag, .. } => Err(BridgeError::UnknownTag(tag)),
        }
    }

    /// Send a typed request.
    pub async fn request<M: BridgeRequest>(&self, message: &M) -> Result<M::Response, BridgeError> {
        let payload = serde_json::to_value(message)?;
        let response = self.send(M::TAG, payload).await?;
        Ok(serde_json::from_value(response)?)
    }
}
