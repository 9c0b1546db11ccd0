//! Ledger event bus: wire protocol, the node-side multiplexer, and a TCP
//! server/client pair for running against an in-process ledger.

mod client;
mod multiplexer;
mod protocol;
mod server;

pub use client::{BusLedger, DEFAULT_REQUEST_TIMEOUT};
pub use multiplexer::{EventMultiplexer, EventSink};
pub use protocol::{framed, BusMessage, SubscribeStatus, MAX_FRAME_LEN};
pub use server::{BusServer, BusServerHandle};
