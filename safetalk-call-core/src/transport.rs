//! Signaling transport implementations
//!
//! - [`WebSocketTransport`] talks to the server-managed channel at
//!   `/ws/video-call/{session_id}/`.
//! - [`MemoryTransport`] connects two sessions in the same process.

use crate::signaling::{SignalingConnector, SignalingError, SignalingMessage, SignalingTransport};
use crate::types::SessionId;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Server base URL, e.g. `wss://safetalk.example`
    pub base_url: String,
    /// Reconnect attempts after the socket drops
    pub max_reconnect_attempts: u32,
    /// Base delay between reconnect attempts in milliseconds
    pub reconnect_backoff_ms: u64,
    /// Queued frames per direction
    pub channel_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:8000".to_string(),
            max_reconnect_attempts: 5,
            reconnect_backoff_ms: 250,
            channel_capacity: 256,
        }
    }
}

impl WebSocketConfig {
    /// Channel URL for a session
    #[must_use]
    pub fn session_url(&self, session_id: &SessionId) -> String {
        format!(
            "{}/ws/video-call/{}/",
            self.base_url.trim_end_matches('/'),
            session_id
        )
    }

    /// Delay before reconnect attempt `attempt` (1-based), capped at 10x
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms * u64::from(attempt.clamp(1, 10)))
    }
}

/// WebSocket signaling transport
///
/// A background task owns the socket. It forwards queued outbound frames,
/// delivers inbound text frames, and reconnects with linear backoff when the
/// socket errors. A close frame from the server ends the channel.
pub struct WebSocketTransport {
    outbound: mpsc::Sender<String>,
    inbound: Mutex<mpsc::Receiver<Result<String, SignalingError>>>,
    shutdown: watch::Sender<bool>,
}

impl WebSocketTransport {
    /// Connect to the channel for `session_id`
    ///
    /// # Errors
    ///
    /// Returns error if the initial WebSocket handshake fails
    #[tracing::instrument(skip(config, session_id), fields(session_id = %session_id))]
    pub async fn connect(
        config: &WebSocketConfig,
        session_id: &SessionId,
    ) -> Result<Self, SignalingError> {
        let url = config.session_url(session_id);
        tracing::info!(url = %url, "Connecting signaling socket");

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::Connect(format!("{url}: {e}")))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_socket(
            url,
            config.clone(),
            stream,
            outbound_rx,
            inbound_tx,
            shutdown_rx,
        ));

        Ok(Self {
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            shutdown: shutdown_tx,
        })
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn send_text(&self, text: String) -> Result<(), SignalingError> {
        self.outbound
            .send(text)
            .await
            .map_err(|_| SignalingError::Closed)
    }

    async fn recv_text(&self) -> Result<Option<String>, SignalingError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(Ok(text)) => Ok(Some(text)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), SignalingError> {
        let _ = self.shutdown.send(true);
        Ok(())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

enum SocketExit {
    /// Local close or all handles dropped
    Shutdown,
    /// Server sent a close frame or ended the stream
    ClosedByServer,
    /// Socket error, eligible for reconnect
    Lost(String),
}

async fn run_socket(
    url: String,
    config: WebSocketConfig,
    initial: WsStream,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<Result<String, SignalingError>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next = Some(initial);

    while let Some(stream) = next.take() {
        match pump(stream, &mut outbound, &inbound, &mut shutdown).await {
            SocketExit::Shutdown => {
                tracing::debug!(url = %url, "Signaling socket shut down");
                return;
            }
            SocketExit::ClosedByServer => {
                tracing::info!(url = %url, "Signaling socket closed by server");
                return;
            }
            SocketExit::Lost(reason) => {
                tracing::warn!(url = %url, error = %reason, "Signaling socket lost, reconnecting");
                next = reconnect(&url, &config, &mut shutdown).await;
                if next.is_none() {
                    let _ = inbound
                        .send(Err(SignalingError::TransportError(format!(
                            "signaling socket lost: {reason}"
                        ))))
                        .await;
                }
            }
        }
    }
}

async fn pump(
    stream: WsStream,
    outbound: &mut mpsc::Receiver<String>,
    inbound: &mpsc::Sender<Result<String, SignalingError>>,
    shutdown: &mut watch::Receiver<bool>,
) -> SocketExit {
    let (mut sink, mut source) = stream.split();

    loop {
        // Queued frames go out before a shutdown is acted on.
        tokio::select! {
            biased;

            queued = outbound.recv() => match queued {
                Some(text) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        return SocketExit::Lost(e.to_string());
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return SocketExit::Shutdown;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    while let Ok(text) = outbound.try_recv() {
                        if sink.send(Message::text(text)).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    return SocketExit::Shutdown;
                }
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(Ok(text.as_str().to_owned())).await.is_err() {
                        return SocketExit::Shutdown;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return SocketExit::ClosedByServer,
                Some(Ok(_)) => {}
                Some(Err(e)) => return SocketExit::Lost(e.to_string()),
            },
        }
    }
}

async fn reconnect(
    url: &str,
    config: &WebSocketConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<WsStream> {
    for attempt in 1..=config.max_reconnect_attempts {
        let delay = config.backoff(attempt);
        tokio::select! {
            _ = shutdown.changed() => return None,
            () = tokio::time::sleep(delay) => {}
        }

        match connect_async(url).await {
            Ok((stream, _)) => {
                tracing::info!(url = %url, attempt, "Signaling socket reconnected");
                return Some(stream);
            }
            Err(e) => {
                tracing::warn!(
                    url = %url,
                    attempt,
                    backoff_ms = delay.as_millis(),
                    error = %e,
                    "Signaling reconnect failed"
                );
            }
        }
    }
    None
}

/// Opens [`WebSocketTransport`]s for sessions
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a connector for the given server
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(
        &self,
        session_id: &SessionId,
    ) -> Result<Arc<dyn SignalingTransport>, SignalingError> {
        let transport = WebSocketTransport::connect(&self.config, session_id).await?;
        Ok(Arc::new(transport))
    }
}

/// One end of an in-process signaling channel
///
/// Every frame sent through this end is also recorded, which lets tests
/// inspect what a session put on the wire.
pub struct MemoryTransport {
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    sent: parking_lot::Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Create two connected ends
    #[must_use]
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            outbound: parking_lot::Mutex::new(Some(a_tx)),
            inbound: Mutex::new(b_rx),
            sent: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let b = Arc::new(Self {
            outbound: parking_lot::Mutex::new(Some(b_tx)),
            inbound: Mutex::new(a_rx),
            sent: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        (a, b)
    }

    /// Raw frames sent through this end
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Decoded messages sent through this end
    #[must_use]
    pub fn sent_messages(&self) -> Vec<SignalingMessage> {
        self.sent
            .lock()
            .iter()
            .filter_map(|text| SignalingMessage::decode(text).ok().flatten())
            .collect()
    }

    /// Whether this end has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn send_text(&self, text: String) -> Result<(), SignalingError> {
        let sender = self.outbound.lock().clone();
        let Some(sender) = sender else {
            return Err(SignalingError::Closed);
        };
        self.sent.lock().push(text.clone());
        sender.send(text).map_err(|_| SignalingError::Closed)
    }

    async fn recv_text(&self) -> Result<Option<String>, SignalingError> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut inbound = self.inbound.lock().await;
        Ok(inbound.recv().await)
    }

    async fn close(&self) -> Result<(), SignalingError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.outbound.lock().take();
        if let Ok(mut inbound) = self.inbound.try_lock() {
            inbound.close();
        }
        Ok(())
    }
}

/// Pairs the two participants of each session in process
///
/// The first `connect` for a session id gets one end of a fresh channel;
/// the second gets the other end. Frames sent before the second participant
/// connects are queued.
#[derive(Default)]
pub struct MemorySignalingHub {
    waiting: parking_lot::Mutex<HashMap<SessionId, Arc<MemoryTransport>>>,
    endpoints: parking_lot::Mutex<HashMap<SessionId, Vec<Arc<MemoryTransport>>>>,
}

impl MemorySignalingHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ends handed out for a session, in connect order
    #[must_use]
    pub fn endpoints(&self, session_id: &SessionId) -> Vec<Arc<MemoryTransport>> {
        self.endpoints
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Take the end reserved for the second participant, if nobody claimed it
    ///
    /// Lets a test play the remote participant by hand.
    #[must_use]
    pub fn take_waiting(&self, session_id: &SessionId) -> Option<Arc<MemoryTransport>> {
        let end = self.waiting.lock().remove(session_id)?;
        self.endpoints
            .lock()
            .entry(session_id.clone())
            .or_default()
            .push(end.clone());
        Some(end)
    }
}

#[async_trait]
impl SignalingConnector for MemorySignalingHub {
    async fn connect(
        &self,
        session_id: &SessionId,
    ) -> Result<Arc<dyn SignalingTransport>, SignalingError> {
        let end = {
            let mut waiting = self.waiting.lock();
            if let Some(end) = waiting.remove(session_id) {
                end
            } else {
                let (first, second) = MemoryTransport::pair();
                waiting.insert(session_id.clone(), second);
                first
            }
        };
        self.endpoints
            .lock()
            .entry(session_id.clone())
            .or_default()
            .push(end.clone());
        tracing::debug!(session_id = %session_id, "In-memory signaling end connected");
        Ok(end)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_session_url() {
        let config = WebSocketConfig {
            base_url: "wss://safetalk.example/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.session_url(&SessionId::from("42")),
            "wss://safetalk.example/ws/video-call/42/"
        );
    }

    #[test]
    fn test_websocket_backoff_is_capped() {
        let config = WebSocketConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(250));
        assert_eq!(config.backoff(3), Duration::from_millis(750));
        assert_eq!(config.backoff(50), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_websocket_connect_failure() {
        let config = WebSocketConfig {
            base_url: "ws://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let result = WebSocketTransport::connect(&config, &SessionId::from("1")).await;
        assert!(matches!(result, Err(SignalingError::Connect(_))));
    }

    #[tokio::test]
    async fn test_websocket_flushes_queued_frames_on_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let frames_tx = frames_tx.clone();
                tokio::spawn(async move {
                    let mut socket = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    let mut received = Vec::new();
                    while let Some(Ok(frame)) = socket.next().await {
                        match frame {
                            Message::Text(text) => received.push(text.as_str().to_owned()),
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                    let _ = frames_tx.send(received);
                });
            }
        });

        let config = WebSocketConfig {
            base_url: format!("ws://{addr}"),
            ..Default::default()
        };
        let hangup = SignalingMessage::hangup().encode().unwrap();
        for round in 0..20 {
            let transport = WebSocketTransport::connect(&config, &SessionId::from("flush"))
                .await
                .unwrap();
            transport.send_text(hangup.clone()).await.unwrap();
            transport.close().await.unwrap();

            let received = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, vec![hangup.clone()], "round {round}");
        }
    }

    #[tokio::test]
    async fn test_memory_pair_delivers_in_order() {
        let (a, b) = MemoryTransport::pair();
        a.send_text("one".to_string()).await.unwrap();
        a.send_text("two".to_string()).await.unwrap();

        assert_eq!(b.recv_text().await.unwrap(), Some("one".to_string()));
        assert_eq!(b.recv_text().await.unwrap(), Some("two".to_string()));
        assert_eq!(a.sent(), vec!["one".to_string(), "two".to_string()]);
        assert!(b.sent().is_empty());
    }

    #[tokio::test]
    async fn test_memory_close_ends_both_directions() {
        let (a, b) = MemoryTransport::pair();
        a.close().await.unwrap();

        assert!(a.is_closed());
        assert_eq!(b.recv_text().await.unwrap(), None);
        assert_eq!(a.send_text("late".to_string()).await, Err(SignalingError::Closed));
        assert_eq!(b.send_text("late".to_string()).await, Err(SignalingError::Closed));
        assert_eq!(a.recv_text().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_hub_pairs_participants() {
        let hub = MemorySignalingHub::new();
        let session = SessionId::from("sess-1");

        let caller = hub.connect(&session).await.unwrap();
        caller
            .send_text(SignalingMessage::hangup().encode().unwrap())
            .await
            .unwrap();

        let callee = hub.connect(&session).await.unwrap();
        let frame = callee.recv_text().await.unwrap().unwrap();
        assert_eq!(
            SignalingMessage::decode(&frame).unwrap(),
            Some(SignalingMessage::hangup())
        );

        let ends = hub.endpoints(&session);
        assert_eq!(ends.len(), 2);
        assert_eq!(ends[0].sent_messages(), vec![SignalingMessage::hangup()]);
    }

    #[tokio::test]
    async fn test_hub_take_waiting_end() {
        let hub = MemorySignalingHub::new();
        let session = SessionId::from("sess-2");

        assert!(hub.take_waiting(&session).is_none());
        let _caller = hub.connect(&session).await.unwrap();
        let remote = hub.take_waiting(&session).unwrap();
        assert!(hub.take_waiting(&session).is_none());
        assert_eq!(hub.endpoints(&session).len(), 2);
        assert!(!remote.is_closed());
    }
}
