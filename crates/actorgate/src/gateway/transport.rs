//! Seams a transport implements to carry stream connections.

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::Payload;

/// Frame read from a stream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Data(Payload),
    /// Ping, pong and other frames with no meaning to actors.
    Control,
    Close,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

/// Write side of a stream connection.
///
/// Text payloads map to text frames and binary payloads to binary frames.
#[async_trait]
pub trait FrameWriter: Send {
    async fn send_frame(&mut self, payload: Payload) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}
