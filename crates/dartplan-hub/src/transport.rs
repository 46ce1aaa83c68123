// Streaming transport: endpoint list, link traits and the tokio-tungstenite connector.
//
// The connection manager only sees `Connector`, `FrameSink` and `FrameSource`,
// so tests can drive it with the in-memory transport in `memory`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::config::{ConnectionConfig, HubConfig};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connecting to {url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    #[error("handshake with {url} failed: {message}")]
    Handshake { url: String, message: String },

    #[error("send failed: {message}")]
    SendFailed { message: String },

    #[error("stream error: {message}")]
    Stream { message: String },

    #[error("failed to encode outbound message: {message}")]
    Encode { message: String },

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// A streaming endpoint and how long to wait for it to accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub timeout: Duration,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Endpoint {
            url: url.into(),
            timeout,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.url.starts_with("wss://")
    }
}

/// The configured endpoints in connection order, each with its timeout.
pub fn endpoints_from(hub: &HubConfig, connection: &ConnectionConfig) -> Vec<Endpoint> {
    hub.endpoints
        .iter()
        .map(|url| Endpoint::new(url.clone(), connection.connect_timeout(url)))
        .collect()
}

// ---------------------------------------------------------------------------
// Link traits
// ---------------------------------------------------------------------------

/// One inbound frame, reduced to what the receive loop acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
    /// Binary, ping, pong and raw frames.
    Ignored,
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<Frame, ConnectionError>>;
}

/// An open streaming connection, split into its two halves.
pub struct Link {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> Result<Link, ConnectionError>;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite
// ---------------------------------------------------------------------------

/// Opens WebSocket links with tokio-tungstenite. TLS certificates are
/// verified against the webpki root store.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Link, ConnectionError> {
        let (ws, response) = tokio_tungstenite::connect_async(endpoint.url.as_str())
            .await
            .map_err(|e| ConnectionError::Handshake {
                url: endpoint.url.clone(),
                message: e.to_string(),
            })?;
        debug!(
            "handshake with {} complete (HTTP {})",
            endpoint.url,
            response.status()
        );
        let (write, read) = ws.split();
        Ok(Link {
            sink: Box::new(MessageSink(write)),
            source: Box::new(MessageSource(read)),
        })
    }
}

/// Map a WebSocket message onto a `Frame`.
pub fn frame_from_message(msg: Message) -> Frame {
    match msg {
        Message::Text(text) => Frame::Text(text.to_string()),
        Message::Close(_) => Frame::Close,
        _ => Frame::Ignored,
    }
}

/// Adapts any WebSocket message sink into a `FrameSink`.
pub struct MessageSink<S>(pub S);

#[async_trait]
impl<S> FrameSink for MessageSink<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ConnectionError::SendFailed {
                message: e.to_string(),
            })
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.0
            .send(Message::Close(None))
            .await
            .map_err(|e| ConnectionError::SendFailed {
                message: e.to_string(),
            })?;
        self.0.close().await.map_err(|e| ConnectionError::SendFailed {
            message: e.to_string(),
        })
    }
}

/// Adapts any WebSocket message stream into a `FrameSource`.
pub struct MessageSource<St>(pub St);

#[async_trait]
impl<St> FrameSource for MessageSource<St>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin + Send,
{
    async fn next_frame(&mut self) -> Option<Result<Frame, ConnectionError>> {
        match self.0.next().await? {
            Ok(msg) => Some(Ok(frame_from_message(msg))),
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                Some(Err(ConnectionError::Closed))
            }
            Err(e) => Some(Err(ConnectionError::Stream {
                message: e.to_string(),
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

/// Channel-backed links for tests and offline runs.
pub mod memory {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{ConnectionError, Connector, Endpoint, Frame, FrameSink, FrameSource, Link};

    enum Scripted {
        Link(Link),
        Fail(String),
        Hang,
    }

    /// A connector that hands out pre-scripted outcomes in order and records
    /// every endpoint it was asked to open.
    #[derive(Default)]
    pub struct MemoryConnector {
        script: Mutex<VecDeque<Scripted>>,
        attempts: Mutex<Vec<String>>,
    }

    impl MemoryConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a successful open; returns the Hub side of the link.
        pub fn push_link(&self) -> MemoryPeer {
            let (link, peer) = pair();
            self.push(Scripted::Link(link));
            peer
        }

        pub fn push_failure(&self, message: &str) {
            self.push(Scripted::Fail(message.to_string()));
        }

        /// Queue an open that never completes.
        pub fn push_hang(&self) {
            self.push(Scripted::Hang);
        }

        pub fn attempts(&self) -> Vec<String> {
            self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
        }

        fn push(&self, item: Scripted) {
            if let Ok(mut script) = self.script.lock() {
                script.push_back(item);
            }
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn open(&self, endpoint: &Endpoint) -> Result<Link, ConnectionError> {
            if let Ok(mut attempts) = self.attempts.lock() {
                attempts.push(endpoint.url.clone());
            }
            let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
            match next {
                Some(Scripted::Link(link)) => Ok(link),
                Some(Scripted::Fail(message)) => Err(ConnectionError::Handshake {
                    url: endpoint.url.clone(),
                    message,
                }),
                Some(Scripted::Hang) => std::future::pending().await,
                None => Err(ConnectionError::Handshake {
                    url: endpoint.url.clone(),
                    message: "no link scripted".into(),
                }),
            }
        }
    }

    /// The Hub's end of an in-memory link.
    pub struct MemoryPeer {
        to_client: Option<mpsc::UnboundedSender<Frame>>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl MemoryPeer {
        /// Deliver a text frame to the client.
        pub fn send_text(&self, text: impl Into<String>) -> bool {
            self.send_frame(Frame::Text(text.into()))
        }

        pub fn send_frame(&self, frame: Frame) -> bool {
            self.to_client
                .as_ref()
                .is_some_and(|tx| tx.send(frame).is_ok())
        }

        /// End the client's inbound stream without a close frame.
        pub fn drop_connection(&mut self) {
            self.to_client = None;
        }

        /// Next text the client sent, or `None` once the client side is gone.
        pub async fn recv(&mut self) -> Option<String> {
            self.from_client.recv().await
        }

        pub fn try_recv(&mut self) -> Option<String> {
            self.from_client.try_recv().ok()
        }
    }

    /// A connected client link and its Hub peer.
    pub fn pair() -> (Link, MemoryPeer) {
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let link = Link {
            sink: Box::new(MemorySink {
                tx: Some(client_tx),
            }),
            source: Box::new(MemorySource { rx: client_rx }),
        };
        let peer = MemoryPeer {
            to_client: Some(to_client),
            from_client,
        };
        (link, peer)
    }

    struct MemorySink {
        tx: Option<mpsc::UnboundedSender<String>>,
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
            let tx = self.tx.as_ref().ok_or(ConnectionError::Closed)?;
            tx.send(text).map_err(|_| ConnectionError::Closed)
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            self.tx = None;
            Ok(())
        }
    }

    struct MemorySource {
        rx: mpsc::UnboundedReceiver<Frame>,
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn next_frame(&mut self) -> Option<Result<Frame, ConnectionError>> {
            self.rx.recv().await.map(Ok)
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    /// Helper: create a stream of Message results from a vec.
    fn mock_stream(
        messages: Vec<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin + Send {
        stream::iter(messages)
    }

    async fn drain(messages: Vec<Result<Message, WsError>>) -> Vec<Result<Frame, String>> {
        let mut source = MessageSource(mock_stream(messages));
        let mut out = Vec::new();
        while let Some(frame) = source.next_frame().await {
            out.push(frame.map_err(|e| e.to_string()));
        }
        out
    }

    #[tokio::test]
    async fn text_frames_preserved_exactly() {
        let payload = r#"{"type":"tournament-match-updated","matchId":"7"}"#;
        let frames = drain(vec![Ok(Message::Text(payload.into()))]).await;
        assert_eq!(frames, vec![Ok(Frame::Text(payload.to_string()))]);
    }

    #[tokio::test]
    async fn close_binary_and_ping_are_classified() {
        let frames = drain(vec![
            Ok(Message::Binary(vec![1, 2, 3].into())),
            Ok(Message::Ping(vec![].into())),
            Ok(Message::Pong(vec![].into())),
            Ok(Message::Close(None)),
        ])
        .await;
        assert_eq!(
            frames,
            vec![
                Ok(Frame::Ignored),
                Ok(Frame::Ignored),
                Ok(Frame::Ignored),
                Ok(Frame::Close)
            ]
        );
    }

    #[tokio::test]
    async fn stream_errors_surface_as_connection_errors() {
        let frames = drain(vec![Err(WsError::ConnectionClosed)]).await;
        assert_eq!(frames, vec![Err("connection closed".to_string())]);
    }

    #[tokio::test]
    async fn empty_stream_ends_immediately() {
        assert!(drain(vec![]).await.is_empty());
    }

    #[test]
    fn endpoints_carry_scheme_specific_timeouts() {
        let hub = HubConfig {
            api_base_url: "https://hub.example.org".into(),
            endpoints: vec!["wss://hub.example.org/ws".into(), "ws://hub.example.org/ws".into()],
            client_name: "dartplan".into(),
            client_version: "0.1.0".into(),
        };
        let eps = endpoints_from(&hub, &ConnectionConfig::default());
        assert_eq!(eps.len(), 2);
        assert!(eps[0].is_secure());
        assert_eq!(eps[0].timeout, Duration::from_secs(15));
        assert!(!eps[1].is_secure());
        assert_eq!(eps[1].timeout, Duration::from_secs(8));
    }

    #[tokio::test]
    async fn memory_connector_follows_script() {
        let connector = memory::MemoryConnector::new();
        connector.push_failure("refused");
        let mut peer = connector.push_link();
        let ep = Endpoint::new("ws://a/ws", Duration::from_secs(1));

        assert!(matches!(
            connector.open(&ep).await,
            Err(ConnectionError::Handshake { .. })
        ));
        let mut link = connector.open(&ep).await.unwrap();
        assert!(connector.open(&ep).await.is_err());
        assert_eq!(connector.attempts().len(), 3);

        link.sink.send_text("hello".into()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("hello"));

        assert!(peer.send_text("from hub"));
        assert_eq!(
            link.source.next_frame().await.unwrap().unwrap(),
            Frame::Text("from hub".into())
        );
        peer.drop_connection();
        assert!(link.source.next_frame().await.is_none());
    }
}
