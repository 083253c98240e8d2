//! JSON framing for one subscriber session.
//!
//! Protocol: one JSON object per text frame. The server sends
//! [`ServerMessage`] frames; the client may send [`ClientMessage`] frames.

use std::fmt;
use std::sync::Arc;

use devserve_core::OwnerId;
use futures::{Sink, SinkExt, Stream, StreamExt};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::broadcast::Broadcaster;
use crate::event::LogEvent;
use crate::state::ServerStatus;

/// Frame sent to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        status: ServerStatus,
        port: Option<u16>,
        pid: Option<u32>,
    },
    Output {
        line: String,
        is_stderr: bool,
    },
    Error {
        message: String,
    },
    Pong,
}

impl From<LogEvent> for ServerMessage {
    fn from(event: LogEvent) -> Self {
        match event {
            LogEvent::Status { status, port, pid } => ServerMessage::Status { status, port, pid },
            LogEvent::Output { line, is_stderr } => ServerMessage::Output { line, is_stderr },
            LogEvent::Error { message } => ServerMessage::Error { message },
        }
    }
}

/// Frame received from a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
}

#[derive(Error, Diagnostic, Debug)]
pub enum ChannelError {
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to send message: {message}")]
    Send { message: String },
}

/// A subscriber session bound to one owner's log.
pub struct LogChannel {
    broadcaster: Arc<Broadcaster>,
    owner: OwnerId,
}

impl LogChannel {
    pub fn new(broadcaster: Arc<Broadcaster>, owner: OwnerId) -> Self {
        Self { broadcaster, owner }
    }

    /// Serve the session until either side closes.
    ///
    /// The session is subscribed for exactly as long as this runs.
    pub async fn run<I, O>(self, mut inbound: I, mut outbound: O) -> Result<(), ChannelError>
    where
        I: Stream<Item = String> + Unpin,
        O: Sink<String> + Unpin,
        O::Error: fmt::Display,
    {
        let (id, mut events) = self.broadcaster.subscribe_channel(&self.owner).await;
        debug!("Log session {:?} opened for {}", id, self.owner);

        let result = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = send(&mut outbound, &ServerMessage::from(event)).await {
                            break Err(e);
                        }
                    }
                    // Dropped by the broadcaster
                    None => break Ok(()),
                },
                frame = inbound.next() => match frame {
                    Some(frame) => match serde_json::from_str::<ClientMessage>(&frame) {
                        Ok(ClientMessage::Ping) => {
                            if let Err(e) = send(&mut outbound, &ServerMessage::Pong).await {
                                break Err(e);
                            }
                        }
                        Err(e) => debug!("Ignoring malformed frame for {}: {}", self.owner, e),
                    },
                    None => break Ok(()),
                },
            }
        };

        self.broadcaster.unsubscribe(&self.owner, id).await;
        debug!("Log session {:?} closed for {}", id, self.owner);
        result
    }
}

async fn send<O>(outbound: &mut O, message: &ServerMessage) -> Result<(), ChannelError>
where
    O: Sink<String> + Unpin,
    O::Error: fmt::Display,
{
    let text = serde_json::to_string(message)?;
    outbound
        .send(text)
        .await
        .map_err(|e| ChannelError::Send {
            message: e.to_string(),
        })
}
