//! Newline-delimited JSON bridge transport over TCP.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BridgeError, BridgeMessage, BridgeReply, BridgeRouter, BridgeTransport};

/// Client side: one connection per request.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    address: String,
    timeout: Duration,
}

impl TcpTransport {
    /// `address` is a `host:port` pair.
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    async fn round_trip(&self, message: &BridgeMessage) -> Result<BridgeReply, BridgeError> {
        let stream = TcpStream::connect(&self.address).await?;
        let (reader, mut writer) = stream.into_split();

        let mut frame = serde_json::to_vec(message)?;
        frame.push(b'\n');
        writer.write_all(&frame).await?;
        writer.flush().await?;

        let mut line = String::new();
        let read = BufReader::new(reader).read_line(&mut line).await?;
        if read == 0 {
            return Err(BridgeError::Transport(
                "connection closed before a reply was received".to_owned(),
            ));
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

#[async_trait]
impl BridgeTransport for TcpTransport {
    async fn exchange(&self, message: BridgeMessage) -> Result<BridgeReply, BridgeError> {
        tokio::time::timeout(self.timeout, self.round_trip(&message))
            .await
            .map_err(|_| {
                BridgeError::Transport(format!(
                    "no reply from {} within {:?}",
                    self.address, self.timeout
                ))
            })?
    }
}

/// Serve bridge requests from `listener` until `shutdown` turns true.
pub async fn serve_tcp(
    listener: TcpListener,
    router: BridgeRouter,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let router = Arc::new(router);
    info!(address = ?listener.local_addr().ok(), tags = ?router.tags(), "bridge listener started");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => break,
        };
        if *shutdown.borrow() {
            break;
        }

        let router = Arc::clone(&router);
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, &router).await {
                warn!(%peer, error = %err, "bridge connection failed");
            }
        });
    }

    info!("bridge listener stopped");
    Ok(())
}

async fn serve_connection(stream: TcpStream, router: &BridgeRouter) -> Result<(), BridgeError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<BridgeMessage>(&line) {
            Ok(message) => {
                debug!(tag = %message.tag, id = %message.id, "bridge request");
                router.dispatch(message).await
            }
            Err(err) => {
                warn!(error = %err, "malformed bridge frame");
                malformed_frame_reply(&line, &err)
            }
        };
        let mut frame = serde_json::to_vec(&reply)?;
        frame.push(b'\n');
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Error reply for a frame that is not a valid [`BridgeMessage`]. Carries the
/// frame's id when one can be read, otherwise the nil id.
fn malformed_frame_reply(line: &str, err: &serde_json::Error) -> BridgeReply {
    let id = serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|frame| frame.get("id").and_then(Value::as_str).map(str::to_owned))
        .and_then(|id| Uuid::parse_str(&id).ok())
        .unwrap_or_else(Uuid::nil);
    BridgeReply::Error {
        id,
        message: format!("malformed bridge frame: {err}"),
    }
}
