//! WebSocket Transport Adapter
//!
//! Implements the [`Transport`] port over `tokio-tungstenite`. The adapter
//! pumps inbound frames into [`TransportEvent`]s on an mpsc channel and
//! drains an outbound queue of control messages.
//!
//! The pipeline side of the boundary never sees reconnection: `run` keeps
//! one logical stream alive, resuming after a fixed pause when a connection
//! ends. Backoff tuning is the upstream operator's policy, not this
//! adapter's; the pause is deliberately constant.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ControlMessage, Transport, TransportError, TransportEvent};

use super::codec::JsonCodec;

/// Outbound queue depth before `send` applies backpressure.
const OUTBOUND_CAPACITY: usize = 64;

/// Pause between connection attempts.
const RESUME_PAUSE: Duration = Duration::from_secs(1);

/// WebSocket adapter configuration.
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Stream endpoint URL.
    pub url: String,
}

/// WebSocket transport for one upstream stream connection.
pub struct WsTransport {
    config: WsTransportConfig,
    codec: JsonCodec,
    event_tx: mpsc::Sender<TransportEvent>,
    outbound_tx: mpsc::Sender<ControlMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<ControlMessage>>>,
    connected: AtomicBool,
    cancel: CancellationToken,
}

impl WsTransport {
    /// Create a transport that reports events on `event_tx`.
    #[must_use]
    pub fn new(
        config: WsTransportConfig,
        event_tx: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        Self {
            config,
            codec: JsonCodec::new(),
            event_tx,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            connected: AtomicBool::new(false),
            cancel,
        }
    }

    /// Whether the connection is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Keep the stream alive until cancelled.
    ///
    /// Each attempt emits `Connecting`, then `Connected` on success,
    /// `Message`/`Error` while up, and `Closed` when the connection ends.
    /// After an attempt ends the adapter pauses briefly and resumes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Failed`] when called twice; the run loop
    /// owns the outbound queue and cannot be shared.
    pub async fn run(self: Arc<Self>) -> Result<(), TransportError> {
        let Some(mut outbound_rx) = self.outbound_rx.lock().take() else {
            return Err(TransportError::Failed(
                "transport run loop already started".to_string(),
            ));
        };

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Feed transport cancelled");
                return Ok(());
            }

            let _ = self.event_tx.send(TransportEvent::Connecting).await;

            match self.connect_and_pump(&mut outbound_rx).await {
                Ok(()) => tracing::info!("Feed connection ended"),
                Err(error) => {
                    tracing::warn!(%error, "Feed connection error");
                }
            }
            self.connected.store(false, Ordering::SeqCst);

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("Feed transport cancelled");
                    return Ok(());
                }
                () = tokio::time::sleep(RESUME_PAUSE) => {}
            }
        }
    }

    /// Drive one connection until it ends.
    async fn connect_and_pump(
        &self,
        outbound_rx: &mut mpsc::Receiver<ControlMessage>,
    ) -> Result<(), TransportError> {
        let (stream, _response) = match connect_async(self.config.url.as_str()).await {
            Ok(established) => established,
            Err(e) => {
                let _ = self
                    .event_tx
                    .send(TransportEvent::Closed {
                        reason: Some(e.to_string()),
                    })
                    .await;
                return Err(TransportError::Failed(e.to_string()));
            }
        };

        self.connected.store(true, Ordering::SeqCst);
        let _ = self.event_tx.send(TransportEvent::Connected).await;
        tracing::info!(url = %self.config.url, "Feed connection established");

        let result = self.pump(stream, outbound_rx).await;

        let reason = result.as_ref().err().map(ToString::to_string);
        let _ = self.event_tx.send(TransportEvent::Closed { reason }).await;
        result
    }

    async fn pump(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        outbound_rx: &mut mpsc::Receiver<ControlMessage>,
    ) -> Result<(), TransportError> {
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                outbound = outbound_rx.recv() => {
                    let Some(message) = outbound else {
                        return Ok(());
                    };
                    match self.codec.encode_control(&message) {
                        Ok(encoded) => {
                            if let Err(e) = sink.send(Message::Text(encoded.into())).await {
                                return Err(TransportError::Failed(e.to_string()));
                            }
                        }
                        Err(e) => {
                            let _ = self
                                .event_tx
                                .send(TransportEvent::Error(e.to_string()))
                                .await;
                        }
                    }
                }
                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            let _ = self
                                .event_tx
                                .send(TransportEvent::Message(text.to_string()))
                                .await;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = sink.send(Message::Pong(payload)).await {
                                return Err(TransportError::Failed(e.to_string()));
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(());
                        }
                        Some(Ok(_)) => {
                            // Binary and pong frames are not part of the protocol.
                        }
                        Some(Err(e)) => {
                            return Err(TransportError::Failed(e.to_string()));
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, message: ControlMessage) -> Result<(), TransportError> {
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn disconnect(&self) {
        // Idempotent: cancelling twice is a no-op.
        self.cancel.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn make_transport() -> (Arc<WsTransport>, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(16);
        let transport = Arc::new(WsTransport::new(
            WsTransportConfig {
                url: "ws://127.0.0.1:1/stream".to_string(),
            },
            event_tx,
            CancellationToken::new(),
        ));
        (transport, event_rx)
    }

    #[tokio::test]
    async fn send_queues_before_connect() {
        let (transport, _event_rx) = make_transport();
        tokio_test::assert_ok!(
            transport
                .send(ControlMessage::subscribe(vec!["AAPL".to_string()]))
                .await
        );
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (transport, _event_rx) = make_transport();
        transport.disconnect().await;
        transport.disconnect().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn failed_connection_emits_connecting_then_closed() {
        let (transport, mut event_rx) = make_transport();
        let handle = tokio::spawn(Arc::clone(&transport).run());

        assert!(matches!(
            event_rx.recv().await,
            Some(TransportEvent::Connecting)
        ));
        assert!(matches!(
            event_rx.recv().await,
            Some(TransportEvent::Closed { reason: Some(_) })
        ));

        transport.disconnect().await;
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run loop must stop after disconnect")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn run_resumes_after_failed_attempt() {
        let (transport, mut event_rx) = make_transport();
        let handle = tokio::spawn(Arc::clone(&transport).run());

        // Two attempts: Connecting/Closed, pause, Connecting again.
        let mut connecting_seen = 0;
        for _ in 0..4 {
            match event_rx.recv().await {
                Some(TransportEvent::Connecting) => connecting_seen += 1,
                Some(TransportEvent::Closed { .. }) => {}
                other => panic!("unexpected event: {other:?}"),
            }
            if connecting_seen == 2 {
                break;
            }
        }
        assert_eq!(connecting_seen, 2);

        transport.disconnect().await;
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    #[tokio::test]
    async fn second_run_refuses_to_start() {
        let (transport, _event_rx) = make_transport();
        transport.disconnect().await;
        // First run takes the outbound receiver and exits on the cancelled token.
        Arc::clone(&transport).run().await.unwrap();
        let result = Arc::clone(&transport).run().await;
        assert!(matches!(result, Err(TransportError::Failed(_))));
    }
}
