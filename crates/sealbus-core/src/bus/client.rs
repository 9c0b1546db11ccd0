//! [`Ledger`] implementation talking to a [`BusServer`](super::BusServer).

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use super::protocol::{framed, BusMessage};
use crate::error::{NodeError, NodeResult};
use crate::ledger::{Ledger, LedgerPayload};

/// Bound on one request/response round trip
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type BusConnection = Framed<TcpStream, LengthDelimitedCodec>;

/// Submission and state client on its own bus connection.
///
/// Requests are serialized on the connection; the connection never
/// subscribes, so every frame read is the reply to the request just sent.
/// A round trip that fails or times out drops the connection, and the
/// next request dials a fresh one, so a late reply is never read as the
/// answer to a later request.
pub struct BusLedger {
    endpoint: String,
    conn: Mutex<Option<BusConnection>>,
    request_timeout: Duration,
}

async fn dial(endpoint: &str) -> NodeResult<BusConnection> {
    let stream = TcpStream::connect(endpoint).await.map_err(|e| {
        NodeError::Transport(format!("Cannot reach ledger at {}: {}", endpoint, e))
    })?;
    debug!(endpoint = %endpoint, "Connected ledger client");
    Ok(framed(stream))
}

impl BusLedger {
    pub async fn connect(endpoint: &str) -> NodeResult<Self> {
        let conn = dial(endpoint).await?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            conn: Mutex::new(Some(conn)),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn round_trip(&self, request: BusMessage) -> NodeResult<BusMessage> {
        let frame = request.encode()?;
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => dial(&self.endpoint).await?,
        };

        let exchange = async {
            conn.send(frame)
                .await
                .map_err(|e| NodeError::Transport(e.to_string()))?;
            match conn.next().await {
                Some(Ok(reply)) => BusMessage::decode(&reply),
                Some(Err(e)) => Err(NodeError::Transport(e.to_string())),
                None => Err(NodeError::Transport(
                    "Ledger closed the connection".to_string(),
                )),
            }
        };

        let result = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Transport(format!(
                "No reply from ledger within {:?}",
                self.request_timeout
            ))),
        };

        match &result {
            Ok(_) => *slot = Some(conn),
            Err(e) => warn!(endpoint = %self.endpoint, error = %e, "Dropping ledger connection"),
        }
        result
    }
}

#[async_trait]
impl Ledger for BusLedger {
    async fn submit(
        &self,
        payload: &LedgerPayload,
        output_addr: Option<&str>,
    ) -> NodeResult<bool> {
        let request = BusMessage::SubmitRequest {
            payload: payload.to_wire().into_bytes(),
            output_addr: output_addr.map(str::to_string),
        };
        match self.round_trip(request).await? {
            BusMessage::SubmitResponse { accepted, address } => {
                if accepted {
                    debug!(group = %payload.group, address = ?address, "Transaction accepted");
                } else {
                    warn!(group = %payload.group, "Transaction rejected by ledger");
                }
                Ok(accepted)
            }
            other => Err(NodeError::Transport(format!(
                "Expected submit_response, got {}",
                other.kind()
            ))),
        }
    }

    async fn query_state(&self, address: &str) -> NodeResult<Option<Vec<u8>>> {
        let request = BusMessage::StateRequest {
            address: address.to_string(),
        };
        match self.round_trip(request).await? {
            BusMessage::StateResponse { data } => Ok(data),
            other => Err(NodeError::Transport(format!(
                "Expected state_response, got {}",
                other.kind()
            ))),
        }
    }
}
