//! Event multiplexer: the single connection to the ledger's event bus.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  EventMultiplexer                                           │
//! │  ├── outbound: mpsc::UnboundedSender<BusMessage>           │
//! │  │   └── subscribe requests queued from any task           │
//! │  ├── shutdown: CancellationToken                           │
//! │  └── task: JoinHandle<()>                                  │
//! │      └── loop: send ≤1 queued frame, receive with timeout, │
//! │          dispatch events to the EventSink                  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! All socket I/O happens inside the loop task, so sends and receives never
//! race on the wire. Dispatch to the sink is awaited inline: a slow sink
//! stalls further event delivery for this node.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{framed, BusMessage, SubscribeStatus};
use crate::error::{NodeError, NodeResult};
use crate::ledger::{EventSubscription, LedgerPayload};

/// Receiver of decoded `(group, blob)` pairs.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Handle one event payload. Must not fail the loop.
    async fn on_event_received(&self, group: &str, blob: &str);
}

pub struct EventMultiplexer {
    namespace_prefix: String,
    outbound: mpsc::UnboundedSender<BusMessage>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventMultiplexer {
    /// Connect to the event bus at `endpoint` and start the loop.
    pub async fn connect(
        endpoint: &str,
        namespace_prefix: &str,
        receive_timeout: Duration,
        sink: Arc<dyn EventSink>,
    ) -> NodeResult<Self> {
        let stream = TcpStream::connect(endpoint).await.map_err(|e| {
            NodeError::Transport(format!("Cannot reach event bus at {}: {}", endpoint, e))
        })?;
        info!(endpoint = %endpoint, "Connected to event bus");
        Ok(Self::start(stream, namespace_prefix, receive_timeout, sink))
    }

    /// Start the loop over an already-connected stream.
    pub fn start<S>(
        stream: S,
        namespace_prefix: &str,
        receive_timeout: Duration,
        sink: Arc<dyn EventSink>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_loop(
            framed(stream),
            outbound_rx,
            sink,
            receive_timeout,
            shutdown.clone(),
        ));

        Self {
            namespace_prefix: namespace_prefix.to_string(),
            outbound,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue a subscription to events of `group` inside this node's namespace.
    ///
    /// Safe to call from any task. The request is sent within one loop
    /// iteration.
    pub fn subscribe_to_group(&self, group: &str) -> NodeResult<()> {
        let request = BusMessage::SubscribeRequest {
            subscriptions: vec![EventSubscription::for_group(group, &self.namespace_prefix)],
        };
        self.outbound
            .send(request)
            .map_err(|_| NodeError::Transport("Event loop has stopped".to_string()))?;
        debug!(group = %group, "Queued subscription");
        Ok(())
    }

    /// Whether the loop task is still alive.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Stop the loop and release the connection.
    ///
    /// Idempotent. Returns once the loop task has exited.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Event loop task failed");
            }
            info!("Event multiplexer closed");
        }
    }
}

impl Drop for EventMultiplexer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_loop<S>(
    mut framed: Framed<S, LengthDelimitedCodec>,
    mut outbound: mpsc::UnboundedReceiver<BusMessage>,
    sink: Arc<dyn EventSink>,
    receive_timeout: Duration,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        // 1. At most one queued frame per iteration
        if let Ok(message) = outbound.try_recv() {
            let kind = message.kind();
            let frame = match message.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(kind, error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if let Err(e) = framed.send(frame).await {
                error!(kind, error = %e, "Event bus send failed");
                break;
            }
            debug!(kind, "Sent frame");
        }

        // 2. Bounded receive so queued subscriptions are never starved
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = tokio::time::timeout(receive_timeout, framed.next()) => received,
        };

        let frame = match received {
            Err(_) => continue,
            Ok(None) => {
                warn!("Event bus closed the connection");
                break;
            }
            Ok(Some(Err(e))) => {
                error!(error = %e, "Event bus receive failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        // 3. Dispatch by message kind
        match BusMessage::decode(&frame) {
            Ok(BusMessage::Events { events }) => {
                for event in events {
                    match LedgerPayload::from_bytes(&event.data) {
                        Ok(payload) => {
                            sink.on_event_received(&payload.group, &payload.blob).await;
                        }
                        Err(e) => {
                            warn!(event_type = %event.event_type, error = %e, "Dropping event");
                        }
                    }
                }
            }
            Ok(BusMessage::SubscribeResponse { status }) => match status {
                SubscribeStatus::Ok => info!("Subscription accepted"),
                other => error!(status = ?other, "Subscription rejected"),
            },
            Ok(other) => warn!(kind = other.kind(), "Unexpected message on event bus"),
            Err(e) => warn!(error = %e, "Dropping undecodable frame"),
        }
    }

    debug!("Event loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerEvent, ADDRESS_ATTRIBUTE};
    use tokio::sync::mpsc::UnboundedSender;

    struct ChannelSink(UnboundedSender<(String, String)>);

    #[async_trait]
    impl EventSink for ChannelSink {
        async fn on_event_received(&self, group: &str, blob: &str) {
            let _ = self.0.send((group.to_string(), blob.to_string()));
        }
    }

    fn events_frame(payloads: &[&[u8]]) -> bytes::Bytes {
        BusMessage::Events {
            events: payloads
                .iter()
                .map(|data| LedgerEvent {
                    event_type: "g".to_string(),
                    attributes: vec![(ADDRESS_ATTRIBUTE.to_string(), "2f9d35aa".to_string())],
                    data: data.to_vec(),
                })
                .collect(),
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_request_is_sent() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mux = EventMultiplexer::start(
            ours,
            "2f9d35",
            Duration::from_millis(20),
            Arc::new(ChannelSink(tx)),
        );
        let mut bus = framed(theirs);

        mux.subscribe_to_group("g").unwrap();
        let frame = bus.next().await.unwrap().unwrap();
        match BusMessage::decode(&frame).unwrap() {
            BusMessage::SubscribeRequest { subscriptions } => {
                assert_eq!(subscriptions, vec![EventSubscription::for_group("g", "2f9d35")]);
            }
            other => panic!("unexpected {:?}", other),
        }
        mux.close().await;
    }

    #[tokio::test]
    async fn test_events_are_dispatched_and_bad_ones_dropped() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mux = EventMultiplexer::start(
            ours,
            "2f9d35",
            Duration::from_millis(20),
            Arc::new(ChannelSink(tx)),
        );
        let mut bus = framed(theirs);

        bus.send(events_frame(&[b"no separator", b"g,QUJD"]))
            .await
            .unwrap();
        bus.send(bytes::Bytes::from_static(b"\xff\xff\xff"))
            .await
            .unwrap();
        bus.send(events_frame(&[b"h,RUZH"])).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), ("g".to_string(), "QUJD".to_string()));
        assert_eq!(rx.recv().await.unwrap(), ("h".to_string(), "RUZH".to_string()));
        assert!(mux.is_running());
        mux.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_loop_and_rejects_subscriptions() {
        let (ours, _theirs) = tokio::io::duplex(4096);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mux = EventMultiplexer::start(
            ours,
            "2f9d35",
            Duration::from_millis(20),
            Arc::new(ChannelSink(tx)),
        );

        mux.close().await;
        assert!(!mux.is_running());
        assert!(mux.subscribe_to_group("g").is_err());
        // Second close is a no-op
        mux.close().await;
    }

    #[tokio::test]
    async fn test_loop_exits_when_bus_disconnects() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mux = EventMultiplexer::start(
            ours,
            "2f9d35",
            Duration::from_millis(20),
            Arc::new(ChannelSink(tx)),
        );
        drop(theirs);

        tokio::time::timeout(Duration::from_secs(2), async {
            while mux.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        mux.close().await;
    }
}
