// RegistrationCoordinator: the register -> subscribe -> announce -> resync
// sequence and the externally visible Hub state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use dartplan_core::pipeline::SharedTournament;

use crate::api::{ApiError, HubApi, RegisterRequest, RegisterResponse, StatusReport};
use crate::connection::{ConnectionManager, ConnectionOutcome, ConnectionTransition};
use crate::protocol::OutboundMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Disconnected,
    Connecting,
    WebSocketReady,
    TournamentRegistered,
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HubState::Disconnected => "disconnected",
            HubState::Connecting => "connecting",
            HubState::WebSocketReady => "websocket-ready",
            HubState::TournamentRegistered => "tournament-registered",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStep {
    Register,
    Subscribe,
    Announce,
    Resync,
}

impl fmt::Display for RegistrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrationStep::Register => "register",
            RegistrationStep::Subscribe => "subscribe",
            RegistrationStep::Announce => "announce",
            RegistrationStep::Resync => "resync",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("connection lost before {step}")]
    ConnectionLost { step: RegistrationStep },

    #[error("{step} failed: {message}")]
    StepFailed {
        step: RegistrationStep,
        message: String,
    },
}

/// How this planner describes itself to the Hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    pub callback_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Drives registration on first connect and after every reconnect.
///
/// The intent to be registered survives link loss; the tournament id never
/// changes, so replaying the sequence converges on the same Hub-side state.
pub struct RegistrationCoordinator {
    connection: Arc<ConnectionManager>,
    api: Arc<dyn HubApi>,
    tournament: Arc<SharedTournament>,
    client: ClientInfo,
    access_key: String,
    intent: AtomicBool,
    client_id: Mutex<Option<String>>,
    registration: Mutex<Option<RegisterResponse>>,
    state: watch::Sender<HubState>,
    sequence: tokio::sync::Mutex<()>,
}

impl RegistrationCoordinator {
    pub fn new(
        connection: Arc<ConnectionManager>,
        api: Arc<dyn HubApi>,
        tournament: Arc<SharedTournament>,
        client: ClientInfo,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(HubState::Disconnected);
        Arc::new(RegistrationCoordinator {
            connection,
            api,
            tournament,
            client,
            access_key: uuid::Uuid::new_v4().to_string(),
            intent: AtomicBool::new(false),
            client_id: Mutex::new(None),
            registration: Mutex::new(None),
            state,
            sequence: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state(&self) -> HubState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<HubState> {
        self.state.subscribe()
    }

    pub fn tournament_id(&self) -> &str {
        self.tournament.id()
    }

    pub fn wants_registration(&self) -> bool {
        self.intent.load(Ordering::SeqCst)
    }

    /// Join and stream URLs from the last successful register call.
    pub fn registration(&self) -> Option<RegisterResponse> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Client id handed out by the Hub's welcome message.
    pub fn set_client_id(&self, client_id: Option<String>) {
        *self.client_id.lock().unwrap_or_else(PoisonError::into_inner) = client_id;
    }

    /// Start following connection transitions. Call before `register` so the
    /// first connect is observed.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let transitions = self.connection.subscribe();
        tokio::spawn(Arc::clone(self).run(transitions))
    }

    /// Declare the intent to be registered and bring the link up. The
    /// sequence itself runs when the connected transition arrives.
    pub async fn register(&self) {
        self.intent.store(true, Ordering::SeqCst);
        if self.connection.is_connected() {
            if let Err(e) = self.run_sequence().await {
                warn!("registration aborted: {e}");
            }
            return;
        }

        self.set_state(HubState::Connecting);
        match self.connection.connect().await {
            ConnectionOutcome::Connected { endpoint } => {
                info!("link to {endpoint} up, waiting for registration")
            }
            ConnectionOutcome::Failed { attempts } => {
                warn!("hub unreachable after {} attempts", attempts.len());
                self.set_state(HubState::Disconnected);
                self.connection.schedule_reconnect();
            }
            ConnectionOutcome::ShuttingDown => {}
        }
    }

    /// Follow connection transitions. The sequence for a link runs as its
    /// own task so a link-down transition is seen while a step is in flight;
    /// that task is aborted when its link goes away.
    async fn run(self: Arc<Self>, mut transitions: broadcast::Receiver<ConnectionTransition>) {
        let shutdown = self.connection.shutdown_token();
        let mut in_flight: Option<JoinHandle<()>> = None;
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = transitions.recv() => received,
            };
            match received {
                Ok(t) if t.connected => {
                    if let Some(stale) = in_flight.take() {
                        stale.abort();
                    }
                    self.set_state(HubState::WebSocketReady);
                    if self.wants_registration() {
                        let this = Arc::clone(&self);
                        in_flight = Some(tokio::spawn(async move {
                            if let Err(e) = this.sequence_on(t.generation).await {
                                warn!("registration on link #{} aborted: {e}", t.generation);
                            }
                        }));
                    }
                }
                Ok(t) => {
                    if let Some(stale) = in_flight.take() {
                        stale.abort();
                    }
                    info!("link down ({}), registration intent kept", t.detail);
                    self.set_state(HubState::Disconnected);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("missed {n} connection transitions");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        if let Some(stale) = in_flight.take() {
            stale.abort();
        }
        self.set_state(HubState::Disconnected);
    }

    /// Run register, subscribe, announce and resync in order on the current
    /// link. Each step first checks that this link is still up; a failure
    /// stops the sequence where it is.
    pub async fn run_sequence(&self) -> Result<(), RegistrationError> {
        self.sequence_on(self.connection.generation()).await
    }

    async fn sequence_on(&self, link: u64) -> Result<(), RegistrationError> {
        let _running = self.sequence.lock().await;
        let tournament_id = self.tournament.id().to_string();

        self.ensure_link(RegistrationStep::Register, link)?;
        info!("registering tournament {tournament_id}");
        let request = RegisterRequest {
            tournament_id: tournament_id.clone(),
            name: self.tournament.name().to_string(),
            description: self.tournament.description().to_string(),
            callback_url: self.client.callback_url.clone(),
            access_key: self.access_key.clone(),
        };
        let response = self
            .api
            .register(&request)
            .await
            .map_err(step_failed(RegistrationStep::Register))?;
        if let Some(url) = response.stream_url.as_deref() {
            self.connection.add_advertised_endpoint(url);
        }
        *self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(response);

        self.ensure_link(RegistrationStep::Subscribe, link)?;
        info!("subscribing to tournament {tournament_id}");
        self.connection
            .send(&OutboundMessage::SubscribeTournament {
                tournament_id: tournament_id.clone(),
            })
            .await
            .map_err(step_failed(RegistrationStep::Subscribe))?;

        self.ensure_link(RegistrationStep::Announce, link)?;
        info!("announcing planner {} {}", self.client.name, self.client.version);
        let client_id = self
            .client_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.connection
            .send(&OutboundMessage::RegisterPlanner {
                tournament_id: tournament_id.clone(),
                client_name: self.client.name.clone(),
                client_version: self.client.version.clone(),
                client_id,
            })
            .await
            .map_err(step_failed(RegistrationStep::Announce))?;

        self.ensure_link(RegistrationStep::Resync, link)?;
        info!("resyncing tournament {tournament_id}");
        let snapshot = self.tournament.snapshot();
        self.api
            .resync(&snapshot)
            .await
            .map_err(step_failed(RegistrationStep::Resync))?;

        // The link may have dropped, or been replaced, while the resync was
        // in flight.
        self.ensure_link(RegistrationStep::Resync, link)?;
        self.connection
            .set_keepalive_tournament(Some(tournament_id.clone()));
        let registered = self.state.send_if_modified(|s| {
            if *s == HubState::WebSocketReady && self.link_is(link) {
                *s = HubState::TournamentRegistered;
                true
            } else {
                false
            }
        });
        if registered {
            info!("hub state -> {}", HubState::TournamentRegistered);
        }
        Ok(())
    }

    /// Send the administrative status heartbeat. Returns false when not
    /// registered, in which case nothing is sent.
    pub async fn report_status(&self) -> Result<bool, ApiError> {
        if self.state() != HubState::TournamentRegistered {
            return Ok(false);
        }
        let report = StatusReport {
            active_matches: self.tournament.active_match_count(),
            total_players: self.tournament.player_count(),
            timestamp: Utc::now(),
        };
        self.api.heartbeat(self.tournament.id(), &report).await?;
        Ok(true)
    }

    /// Drop the registration intent, optionally unregister, and stop the
    /// connection for good.
    pub async fn shutdown(&self, unregister: bool) {
        self.intent.store(false, Ordering::SeqCst);
        if unregister {
            if let Err(e) = self.api.unregister(self.tournament.id()).await {
                warn!("unregister failed: {e}");
            }
        }
        self.connection.set_keepalive_tournament(None);
        self.connection.shutdown().await;
        self.set_state(HubState::Disconnected);
    }

    fn ensure_link(&self, step: RegistrationStep, link: u64) -> Result<(), RegistrationError> {
        if self.link_is(link) && self.wants_registration() {
            Ok(())
        } else {
            Err(RegistrationError::ConnectionLost { step })
        }
    }

    fn link_is(&self, link: u64) -> bool {
        self.connection.is_connected() && self.connection.generation() == link
    }

    fn set_state(&self, next: HubState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!("hub state {current} -> {next}");
            *current = next;
            true
        });
    }
}

fn step_failed<E: fmt::Display>(step: RegistrationStep) -> impl Fn(E) -> RegistrationError {
    move |e| RegistrationError::StepFailed {
        step,
        message: e.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
