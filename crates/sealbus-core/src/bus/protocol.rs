//! Event bus wire protocol.
//!
//! Frames are length-delimited and carry one postcard-encoded [`BusMessage`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{NodeError, NodeResult};
use crate::ledger::{EventSubscription, LedgerEvent};

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeStatus {
    Ok,
    InvalidFilter,
    InternalError,
}

/// Messages exchanged with the ledger's event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusMessage {
    /// Add subscriptions for this connection
    SubscribeRequest {
        subscriptions: Vec<EventSubscription>,
    },
    SubscribeResponse {
        status: SubscribeStatus,
    },
    /// A batch of events matching the connection's subscriptions
    Events {
        events: Vec<LedgerEvent>,
    },
    SubmitRequest {
        payload: Vec<u8>,
        output_addr: Option<String>,
    },
    SubmitResponse {
        accepted: bool,
        address: Option<String>,
    },
    StateRequest {
        address: String,
    },
    StateResponse {
        data: Option<Vec<u8>>,
    },
}

impl BusMessage {
    pub fn encode(&self) -> NodeResult<Bytes> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(|e| NodeError::Serialization(format!("Failed to encode frame: {}", e)))
    }

    pub fn decode(frame: &[u8]) -> NodeResult<Self> {
        postcard::from_bytes(frame)
            .map_err(|e| NodeError::MalformedMessage(format!("Failed to decode frame: {}", e)))
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::SubscribeRequest { .. } => "subscribe_request",
            BusMessage::SubscribeResponse { .. } => "subscribe_response",
            BusMessage::Events { .. } => "events",
            BusMessage::SubmitRequest { .. } => "submit_request",
            BusMessage::SubmitResponse { .. } => "submit_response",
            BusMessage::StateRequest { .. } => "state_request",
            BusMessage::StateResponse { .. } => "state_response",
        }
    }
}

/// Wrap a byte stream in the bus framing.
pub fn framed<S>(io: S) -> Framed<S, LengthDelimitedCodec>
where
    S: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    Framed::new(io, codec)
}
