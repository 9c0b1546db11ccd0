//! TCP event bus serving a [`MemoryLedger`].
//!
//! Each connection may subscribe to events and submit transactions or read
//! state. Events are pushed as they are fired, filtered by the connection's
//! subscriptions.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{framed, BusMessage, SubscribeStatus};
use crate::error::{NodeError, NodeResult};
use crate::ledger::{EventSubscription, LedgerEvent, MemoryLedger};

pub struct BusServer {
    listener: TcpListener,
    ledger: Arc<MemoryLedger>,
}

/// A running [`BusServer`].
pub struct BusServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl BusServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drop every connection and wait for the server task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Bus server task failed");
        }
    }
}

impl BusServer {
    pub async fn bind<A: ToSocketAddrs>(addr: A, ledger: Arc<MemoryLedger>) -> NodeResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NodeError::Transport(format!("Cannot bind event bus: {}", e)))?;
        Ok(Self { listener, ledger })
    }

    pub fn local_addr(&self) -> NodeResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| NodeError::Transport(e.to_string()))
    }

    /// Run the accept loop until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(addr = ?self.listener.local_addr().ok(), "Event bus listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Bus client connected");
                    let ledger = self.ledger.clone();
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        serve_connection(framed(stream), ledger, shutdown).await;
                        debug!(peer = %peer, "Bus client disconnected");
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }

        info!("Event bus stopped");
    }

    /// Run the server on a background task.
    pub fn spawn(self) -> NodeResult<BusServerHandle> {
        let local_addr = self.local_addr()?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(shutdown.clone()));
        Ok(BusServerHandle {
            local_addr,
            shutdown,
            task,
        })
    }
}

async fn serve_connection<S>(
    mut framed: Framed<S, LengthDelimitedCodec>,
    ledger: Arc<MemoryLedger>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut events = ledger.subscribe();
    let mut subscriptions: Vec<EventSubscription> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            frame = framed.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!(error = %e, "Bus client read failed");
                        break;
                    }
                    None => break,
                };

                let reply = match BusMessage::decode(&frame) {
                    Ok(request) => handle_request(request, &ledger, &mut subscriptions),
                    Err(e) => {
                        warn!(error = %e, "Undecodable request");
                        None
                    }
                };

                if let Some(reply) = reply {
                    if !send(&mut framed, &reply).await {
                        break;
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if !matches_any(&subscriptions, &event) {
                            continue;
                        }
                        let batch = BusMessage::Events { events: vec![event] };
                        if !send(&mut framed, &batch).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Bus client lagging, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

fn handle_request(
    request: BusMessage,
    ledger: &MemoryLedger,
    subscriptions: &mut Vec<EventSubscription>,
) -> Option<BusMessage> {
    match request {
        BusMessage::SubscribeRequest {
            subscriptions: requested,
        } => {
            let status = if requested.iter().all(|s| !s.event_type.is_empty()) {
                for sub in &requested {
                    debug!(event_type = %sub.event_type, "Client subscribed");
                }
                subscriptions.extend(requested);
                SubscribeStatus::Ok
            } else {
                SubscribeStatus::InvalidFilter
            };
            Some(BusMessage::SubscribeResponse { status })
        }
        BusMessage::SubmitRequest {
            payload,
            output_addr,
        } => match ledger.apply(&payload, output_addr.as_deref()) {
            Ok(address) => Some(BusMessage::SubmitResponse {
                accepted: true,
                address: Some(address),
            }),
            Err(e) => {
                warn!(error = %e, "Transaction rejected");
                Some(BusMessage::SubmitResponse {
                    accepted: false,
                    address: None,
                })
            }
        },
        BusMessage::StateRequest { address } => Some(BusMessage::StateResponse {
            data: ledger.state_at(&address),
        }),
        other => {
            warn!(kind = other.kind(), "Unexpected request");
            None
        }
    }
}

fn matches_any(subscriptions: &[EventSubscription], event: &LedgerEvent) -> bool {
    subscriptions.iter().any(|s| s.matches(event))
}

async fn send<S>(framed: &mut Framed<S, LengthDelimitedCodec>, message: &BusMessage) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = match message.encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Failed to encode reply");
            return true;
        }
    };
    match framed.send(frame).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Bus client write failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::DEFAULT_NAMESPACE_PREFIX;
    use std::time::Duration;
    use tokio::net::TcpStream;

    async fn request(
        client: &mut Framed<TcpStream, LengthDelimitedCodec>,
        message: BusMessage,
    ) -> BusMessage {
        client.send(message.encode().unwrap()).await.unwrap();
        let frame = client.next().await.unwrap().unwrap();
        BusMessage::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_then_receive_matching_events_only() {
        let ledger = Arc::new(MemoryLedger::default());
        let server = BusServer::bind("127.0.0.1:0", ledger.clone()).await.unwrap();
        let handle = server.spawn().unwrap();

        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut client = framed(stream);

        let reply = request(
            &mut client,
            BusMessage::SubscribeRequest {
                subscriptions: vec![EventSubscription::for_group(
                    "g",
                    DEFAULT_NAMESPACE_PREFIX,
                )],
            },
        )
        .await;
        assert_eq!(
            reply,
            BusMessage::SubscribeResponse {
                status: SubscribeStatus::Ok
            }
        );

        ledger.apply(b"other,QUJD", None).unwrap();
        ledger.apply(b"g,RUZH", None).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match BusMessage::decode(&frame).unwrap() {
            BusMessage::Events { events } => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].data, b"g,RUZH");
            }
            other => panic!("unexpected {:?}", other),
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_and_query_state() {
        let ledger = Arc::new(MemoryLedger::default());
        let handle = BusServer::bind("127.0.0.1:0", ledger.clone())
            .await
            .unwrap()
            .spawn()
            .unwrap();

        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut client = framed(stream);

        let address = match request(
            &mut client,
            BusMessage::SubmitRequest {
                payload: b"g,QUJD".to_vec(),
                output_addr: None,
            },
        )
        .await
        {
            BusMessage::SubmitResponse {
                accepted: true,
                address: Some(address),
            } => address,
            other => panic!("unexpected {:?}", other),
        };

        let reply = request(&mut client, BusMessage::StateRequest { address }).await;
        assert_eq!(
            reply,
            BusMessage::StateResponse {
                data: Some(b"g,QUJD".to_vec())
            }
        );

        let rejected = request(
            &mut client,
            BusMessage::SubmitRequest {
                payload: b"no-separator".to_vec(),
                output_addr: None,
            },
        )
        .await;
        assert_eq!(
            rejected,
            BusMessage::SubmitResponse {
                accepted: false,
                address: None
            }
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_event_type_rejected() {
        let ledger = Arc::new(MemoryLedger::default());
        let handle = BusServer::bind("127.0.0.1:0", ledger)
            .await
            .unwrap()
            .spawn()
            .unwrap();

        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut client = framed(stream);
        let reply = request(
            &mut client,
            BusMessage::SubscribeRequest {
                subscriptions: vec![EventSubscription {
                    event_type: String::new(),
                    filters: vec![],
                }],
            },
        )
        .await;
        assert_eq!(
            reply,
            BusMessage::SubscribeResponse {
                status: SubscribeStatus::InvalidFilter
            }
        );
        handle.shutdown().await;
    }
}
