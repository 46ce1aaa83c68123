// ConnectionManager: multi-endpoint connect, receive and keep-alive loops,
// connection transitions and automatic reconnect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::protocol::OutboundMessage;
use crate::transport::{ConnectionError, Connector, Endpoint, Frame, FrameSink, FrameSource, Link};

const DEFAULT_ADVERTISED_TIMEOUT: Duration = Duration::from_secs(15);

/// Timing knobs for an open link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub read_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect_delay: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        ConnectionSettings {
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            keepalive_interval: Duration::from_secs(config.keepalive_interval_secs),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
        }
    }
}

/// Published whenever the link comes up or goes down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTransition {
    pub connected: bool,
    /// Link the transition belongs to.
    pub generation: u64,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Connected { endpoint: String },
    /// Every endpoint was tried, in order, and none accepted.
    Failed { attempts: Vec<String> },
    ShuttingDown,
}

/// Anything that can push an outbound message to the Hub.
#[async_trait]
pub trait HubSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), ConnectionError>;
    fn is_connected(&self) -> bool;
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Owns the streaming link to the Hub.
///
/// Each successful `connect` starts a new link generation with its own
/// receive and keep-alive tasks. When a link is lost the manager emits a
/// disconnected transition and, unless shut down, schedules a single pending
/// reconnect that keeps retrying with a fixed delay.
pub struct ConnectionManager {
    endpoints: Mutex<Vec<Endpoint>>,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    sink: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    connect_lock: tokio::sync::Mutex<()>,
    connected: AtomicBool,
    generation: AtomicU64,
    reconnect_pending: AtomicBool,
    current_endpoint: Mutex<Option<String>>,
    keepalive_tournament: Mutex<Option<String>>,
    transitions: broadcast::Sender<ConnectionTransition>,
    inbound: mpsc::Sender<String>,
    shutdown: CancellationToken,
    link_token: Mutex<CancellationToken>,
}

impl ConnectionManager {
    /// Create a manager. Raw text frames from every link are forwarded to
    /// `inbound` in arrival order.
    pub fn new(
        endpoints: Vec<Endpoint>,
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
        inbound: mpsc::Sender<String>,
    ) -> Arc<Self> {
        let (transitions, _) = broadcast::channel(32);
        Arc::new(ConnectionManager {
            endpoints: Mutex::new(endpoints),
            connector,
            settings,
            sink: tokio::sync::Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reconnect_pending: AtomicBool::new(false),
            current_endpoint: Mutex::new(None),
            keepalive_tournament: Mutex::new(None),
            transitions,
            inbound,
            shutdown: CancellationToken::new(),
            link_token: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionTransition> {
        self.transitions.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn current_endpoint(&self) -> Option<String> {
        guard(&self.current_endpoint).clone()
    }

    /// Generation of the most recently attached link. Only meaningful while
    /// `is_connected` holds.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        guard(&self.endpoints).clone()
    }

    /// Append an endpoint advertised by the Hub after the configured ones.
    /// It takes the connect timeout of a configured endpoint with the same
    /// scheme, else the longest one. Returns false for duplicates and
    /// non-streaming URLs.
    pub fn add_advertised_endpoint(&self, url: &str) -> bool {
        let url = url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            warn!("ignoring advertised endpoint {url}: not a ws:// or wss:// URL");
            return false;
        }
        let mut endpoints = guard(&self.endpoints);
        if endpoints.iter().any(|e| e.url == url) {
            return false;
        }
        let secure = url.starts_with("wss://");
        let timeout = endpoints
            .iter()
            .find(|e| e.is_secure() == secure)
            .or_else(|| endpoints.iter().max_by_key(|e| e.timeout))
            .map_or(DEFAULT_ADVERTISED_TIMEOUT, |e| e.timeout);
        info!("hub advertised endpoint {url}, tried after {} configured", endpoints.len());
        endpoints.push(Endpoint::new(url, timeout));
        true
    }

    /// Tournament id carried by keep-alive heartbeats.
    pub fn set_keepalive_tournament(&self, tournament_id: Option<String>) {
        *guard(&self.keepalive_tournament) = tournament_id;
    }

    /// Try each endpoint in order and attach the first link that opens.
    /// Returns immediately if a link is already up.
    pub async fn connect(self: &Arc<Self>) -> ConnectionOutcome {
        let _connecting = self.connect_lock.lock().await;
        if self.shutdown.is_cancelled() {
            return ConnectionOutcome::ShuttingDown;
        }
        if self.is_connected() {
            if let Some(endpoint) = self.current_endpoint() {
                return ConnectionOutcome::Connected { endpoint };
            }
        }

        let endpoints = self.endpoints();
        let mut attempts = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            attempts.push(endpoint.url.clone());
            info!(
                "connecting to {} (timeout {}s)",
                endpoint.url,
                endpoint.timeout.as_secs_f32()
            );
            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => return ConnectionOutcome::ShuttingDown,
                opened = tokio::time::timeout(endpoint.timeout, self.connector.open(endpoint)) => opened,
            };
            match opened {
                Ok(Ok(link)) => {
                    self.attach(link, endpoint).await;
                    return ConnectionOutcome::Connected {
                        endpoint: endpoint.url.clone(),
                    };
                }
                Ok(Err(e)) => warn!("connection to {} failed: {e}", endpoint.url),
                Err(_) => warn!(
                    "{}",
                    ConnectionError::Timeout {
                        url: endpoint.url.clone(),
                        secs: endpoint.timeout.as_secs(),
                    }
                ),
            }
        }

        warn!("all {} streaming endpoints failed", attempts.len());
        ConnectionOutcome::Failed { attempts }
    }

    async fn attach(self: &Arc<Self>, link: Link, endpoint: &Endpoint) {
        let Link { sink, source } = link;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.sink.lock().await = Some(sink);
        *guard(&self.current_endpoint) = Some(endpoint.url.clone());

        let token = self.shutdown.child_token();
        {
            let mut current = guard(&self.link_token);
            current.cancel();
            *current = token.clone();
        }

        self.connected.store(true, Ordering::SeqCst);
        info!("connected to {} (link #{generation})", endpoint.url);
        self.emit(true, generation, format!("connected to {}", endpoint.url));

        tokio::spawn(Arc::clone(self).receive_loop(generation, source, token.clone()));
        tokio::spawn(Arc::clone(self).keepalive_loop(generation, token));
    }

    async fn receive_loop(
        self: Arc<Self>,
        generation: u64,
        mut source: Box<dyn FrameSource>,
        token: CancellationToken,
    ) {
        let read_timeout = self.settings.read_timeout;
        let reason = loop {
            let next = tokio::select! {
                _ = token.cancelled() => return,
                next = tokio::time::timeout(read_timeout, source.next_frame()) => next,
            };
            match next {
                Err(_) => break format!("no frame received within {}s", read_timeout.as_secs()),
                Ok(None) => break "stream ended".to_string(),
                Ok(Some(Err(e))) => break e.to_string(),
                Ok(Some(Ok(Frame::Close))) => break "closed by hub".to_string(),
                Ok(Some(Ok(Frame::Ignored))) => {}
                Ok(Some(Ok(Frame::Text(text)))) => {
                    debug!("received {} bytes on link #{generation}", text.len());
                    if self.inbound.send(text).await.is_err() {
                        break "inbound channel closed".to_string();
                    }
                }
            }
        };
        self.link_lost(generation, &reason).await;
    }

    async fn keepalive_loop(self: Arc<Self>, generation: u64, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.keepalive_interval);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let heartbeat = OutboundMessage::Heartbeat {
                timestamp: Utc::now(),
                tournament_id: guard(&self.keepalive_tournament).clone(),
            };
            if let Err(e) = self.send(&heartbeat).await {
                self.link_lost(generation, &format!("keep-alive failed: {e}"))
                    .await;
                return;
            }
        }
    }

    /// Tear down link `generation` if it is still the current one.
    async fn link_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if self
            .connected
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        guard(&self.link_token).cancel();
        self.sink.lock().await.take();
        warn!("connection lost: {reason}");
        self.emit(false, generation, reason.to_string());

        if self.shutdown.is_cancelled() {
            return;
        }
        self.schedule_reconnect();
    }

    /// Schedule a reconnect after the configured delay. At most one is
    /// pending at a time; a failed attempt re-arms it.
    pub fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            debug!("reconnect already scheduled");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                info!(
                    "reconnecting in {}s",
                    this.settings.reconnect_delay.as_secs_f32()
                );
                tokio::select! {
                    _ = this.shutdown.cancelled() => {
                        this.reconnect_pending.store(false, Ordering::SeqCst);
                        return;
                    }
                    _ = tokio::time::sleep(this.settings.reconnect_delay) => {}
                }
                this.reconnect_pending.store(false, Ordering::SeqCst);
                match this.connect().await {
                    ConnectionOutcome::Failed { .. } => {
                        if this.reconnect_pending.swap(true, Ordering::SeqCst) {
                            return;
                        }
                    }
                    ConnectionOutcome::Connected { .. } | ConnectionOutcome::ShuttingDown => return,
                }
            }
        });
    }

    /// Serialize and send one message. Sends are serialized by the sink lock.
    pub async fn send(&self, message: &OutboundMessage) -> Result<(), ConnectionError> {
        let text = message.to_json().map_err(|e| ConnectionError::Encode {
            message: e.to_string(),
        })?;
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(ConnectionError::NotConnected);
        };
        sink.send_text(text).await?;
        debug!("sent {}", message.kind());
        Ok(())
    }

    /// Close the current link without scheduling a reconnect.
    pub async fn close(&self) {
        guard(&self.link_token).cancel();
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!("close frame not delivered: {e}");
            }
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("connection closed by client");
            self.emit(false, self.generation(), "closed by client".to_string());
        }
    }

    /// Stop every loop, suppress reconnects and close the link.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.close().await;
    }

    fn emit(&self, connected: bool, generation: u64, detail: String) {
        // No subscribers is fine.
        let _ = self.transitions.send(ConnectionTransition {
            connected,
            generation,
            detail,
        });
    }
}

#[async_trait]
impl HubSender for ConnectionManager {
    async fn send(&self, message: &OutboundMessage) -> Result<(), ConnectionError> {
        ConnectionManager::send(self, message).await
    }

    fn is_connected(&self) -> bool {
        ConnectionManager::is_connected(self)
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
