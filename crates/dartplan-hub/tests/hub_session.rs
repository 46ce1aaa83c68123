// Integration tests for the Hub client session.
//
// Links are in-memory (transport::memory) and the administrative API is a
// recording fake, so these run the real connection manager, registration
// coordinator, router and event loop without any network.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Notify};

use dartplan_core::collab::TournamentStore;
use dartplan_core::model::{Group, Match, MatchStatus, Player, Tournament, TournamentClass};
use dartplan_core::pipeline::SharedTournament;
use dartplan_core::store::SqliteStore;
use dartplan_hub::api::{ApiError, HubApi, RegisterRequest, RegisterResponse, StatusReport};
use dartplan_hub::app;
use dartplan_hub::config::{Config, ConnectionConfig, CredentialsConfig, HubConfig, TournamentConfig};
use dartplan_hub::connection::{ConnectionManager, ConnectionSettings};
use dartplan_hub::registration::{ClientInfo, HubState, RegistrationCoordinator};
use dartplan_hub::transport::memory::{MemoryConnector, MemoryPeer};
use dartplan_hub::transport::{Connector, Endpoint};

// ===========================================================================
// Test helpers
// ===========================================================================

/// Records every call together with the Hub state observed at that moment.
#[derive(Default)]
struct RecordingApi {
    calls: Mutex<Vec<String>>,
    observer: Mutex<Option<watch::Receiver<HubState>>>,
    /// The first resync never answers.
    stall_first_resync: AtomicBool,
    resync_stalled: Notify,
    /// Every status heartbeat never answers.
    stall_heartbeat: AtomicBool,
}

impl RecordingApi {
    fn observe(&self, rx: watch::Receiver<HubState>) {
        *self.observer.lock().unwrap() = Some(rx);
    }

    fn record(&self, call: String) {
        let state = self
            .observer
            .lock()
            .unwrap()
            .as_ref()
            .map(|rx| rx.borrow().to_string())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(format!("{call} @{state}"));
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HubApi for RecordingApi {
    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, ApiError> {
        self.record(format!("register {} key={}", request.tournament_id, !request.access_key.is_empty()));
        Ok(RegisterResponse::default())
    }

    async fn heartbeat(&self, tournament_id: &str, _report: &StatusReport) -> Result<(), ApiError> {
        self.record(format!("heartbeat {tournament_id}"));
        if self.stall_heartbeat.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn unregister(&self, tournament_id: &str) -> Result<(), ApiError> {
        self.record(format!("unregister {tournament_id}"));
        Ok(())
    }

    async fn resync(&self, tournament: &Tournament) -> Result<(), ApiError> {
        self.record(format!("resync {}", tournament.id));
        if self.stall_first_resync.swap(false, Ordering::SeqCst) {
            self.resync_stalled.notify_one();
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

fn sample_tournament() -> Tournament {
    let mut class = TournamentClass::new(1, "Open");
    class.players = vec![
        Player { id: 1, name: "Anna".into() },
        Player { id: 2, name: "Ben".into() },
    ];
    let mut group = Group::new(1, "A");
    group.matches.push(Match::new(7, 1, Some(2)));
    class.groups.push(group);
    let mut t = Tournament::new("T-7", "Club Night");
    t.classes.push(class);
    t
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next message the client sent, skipping keep-alives.
async fn next_sent(peer: &mut MemoryPeer) -> Value {
    loop {
        let raw = tokio::time::timeout(Duration::from_secs(2), peer.recv())
            .await
            .expect("client should send")
            .expect("link open");
        let v: Value = serde_json::from_str(&raw).unwrap();
        if v["type"] != "heartbeat" {
            return v;
        }
    }
}

// ===========================================================================
// Scenario C: reconnect replays registration
// ===========================================================================

#[tokio::test]
async fn reconnect_replays_registration_before_reporting_registered() {
    let connector = Arc::new(MemoryConnector::new());
    let mut first = connector.push_link();
    let mut second = connector.push_link();

    let (inbound_tx, _inbound_rx) = mpsc::channel(16);
    let dyn_connector: Arc<dyn Connector> = connector.clone();
    let connection = ConnectionManager::new(
        vec![Endpoint::new("ws://hub/ws", Duration::from_millis(200))],
        dyn_connector,
        ConnectionSettings {
            read_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(25),
            reconnect_delay: Duration::from_millis(20),
        },
        inbound_tx,
    );
    let api = Arc::new(RecordingApi::default());
    let dyn_api: Arc<dyn HubApi> = api.clone();
    let coordinator = RegistrationCoordinator::new(
        Arc::clone(&connection),
        dyn_api,
        Arc::new(SharedTournament::new(sample_tournament())),
        ClientInfo {
            name: "dartplan".into(),
            version: "0.1.0".into(),
            callback_url: None,
        },
    );
    api.observe(coordinator.watch_state());
    coordinator.start();

    coordinator.register().await;
    eventually("first registration", || {
        coordinator.state() == HubState::TournamentRegistered
    })
    .await;
    assert_eq!(next_sent(&mut first).await["type"], "subscribe-tournament");
    assert_eq!(next_sent(&mut first).await["type"], "register-planner");

    // Drop the socket while registered.
    first.drop_connection();

    eventually("second registration", || {
        api.calls().len() == 4 && coordinator.state() == HubState::TournamentRegistered
    })
    .await;

    assert_eq!(
        api.calls(),
        vec![
            "register T-7 key=true @websocket-ready",
            "resync T-7 @websocket-ready",
            "register T-7 key=true @websocket-ready",
            "resync T-7 @websocket-ready",
        ]
    );
    let subscribe = next_sent(&mut second).await;
    assert_eq!(subscribe["type"], "subscribe-tournament");
    assert_eq!(subscribe["tournamentId"], "T-7");
    let announce = next_sent(&mut second).await;
    assert_eq!(announce["type"], "register-planner");
    assert_eq!(announce["tournamentId"], "T-7");

    assert_eq!(coordinator.tournament_id(), "T-7");
    assert!(coordinator.wants_registration());
    assert_eq!(connector.attempts().len(), 2);
}

/// Every state the coordinator publishes, in order.
fn record_states(mut rx: watch::Receiver<HubState>) -> Arc<Mutex<Vec<HubState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            sink.lock().unwrap().push(state);
        }
    });
    seen
}

#[tokio::test]
async fn link_loss_during_resync_drops_to_disconnected_then_replays() {
    let connector = Arc::new(MemoryConnector::new());
    let mut first = connector.push_link();
    let mut second = connector.push_link();

    let (inbound_tx, _inbound_rx) = mpsc::channel(16);
    let dyn_connector: Arc<dyn Connector> = connector.clone();
    let connection = ConnectionManager::new(
        vec![Endpoint::new("ws://hub/ws", Duration::from_millis(200))],
        dyn_connector,
        ConnectionSettings {
            read_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(25),
            reconnect_delay: Duration::from_millis(300),
        },
        inbound_tx,
    );
    let api = Arc::new(RecordingApi::default());
    api.stall_first_resync.store(true, Ordering::SeqCst);
    let dyn_api: Arc<dyn HubApi> = api.clone();
    let coordinator = RegistrationCoordinator::new(
        Arc::clone(&connection),
        dyn_api,
        Arc::new(SharedTournament::new(sample_tournament())),
        ClientInfo {
            name: "dartplan".into(),
            version: "0.1.0".into(),
            callback_url: None,
        },
    );
    let history = record_states(coordinator.watch_state());
    coordinator.start();

    coordinator.register().await;
    tokio::time::timeout(Duration::from_secs(2), api.resync_stalled.notified())
        .await
        .expect("first resync should start");
    assert_eq!(next_sent(&mut first).await["type"], "subscribe-tournament");
    assert_eq!(next_sent(&mut first).await["type"], "register-planner");

    first.drop_connection();
    eventually("disconnected before reconnect", || {
        coordinator.state() == HubState::Disconnected
    })
    .await;
    assert_eq!(connector.attempts().len(), 1);

    eventually("registration on the new link", || {
        coordinator.state() == HubState::TournamentRegistered
    })
    .await;
    assert_eq!(next_sent(&mut second).await["type"], "subscribe-tournament");
    assert_eq!(next_sent(&mut second).await["type"], "register-planner");
    assert_eq!(connector.attempts().len(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let history = history.lock().unwrap().clone();
    let dropped = history
        .iter()
        .position(|s| *s == HubState::Disconnected)
        .expect("socket loss must be visible");
    assert!(!history[..dropped].contains(&HubState::TournamentRegistered));
    assert_eq!(history.last(), Some(&HubState::TournamentRegistered));
}

#[tokio::test]
async fn unreachable_hub_is_retried_until_it_answers() {
    let connector = Arc::new(MemoryConnector::new());
    connector.push_failure("refused");
    connector.push_failure("refused");
    let mut peer = connector.push_link();

    let (inbound_tx, _inbound_rx) = mpsc::channel(16);
    let dyn_connector: Arc<dyn Connector> = connector.clone();
    let connection = ConnectionManager::new(
        vec![Endpoint::new("wss://hub/ws", Duration::from_millis(200))],
        dyn_connector,
        ConnectionSettings {
            read_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(25),
            reconnect_delay: Duration::from_millis(20),
        },
        inbound_tx,
    );
    let api = Arc::new(RecordingApi::default());
    let dyn_api: Arc<dyn HubApi> = api.clone();
    let coordinator = RegistrationCoordinator::new(
        connection,
        dyn_api,
        Arc::new(SharedTournament::new(sample_tournament())),
        ClientInfo {
            name: "dartplan".into(),
            version: "0.1.0".into(),
            callback_url: None,
        },
    );
    coordinator.start();

    coordinator.register().await;
    assert_eq!(coordinator.state(), HubState::Disconnected);

    eventually("registration after retries", || {
        coordinator.state() == HubState::TournamentRegistered
    })
    .await;
    assert_eq!(connector.attempts().len(), 3);
    assert_eq!(next_sent(&mut peer).await["type"], "subscribe-tournament");
}

// ===========================================================================
// Full event loop
// ===========================================================================

fn config() -> Config {
    Config {
        hub: HubConfig {
            api_base_url: "https://hub.example.org".into(),
            endpoints: vec!["ws://hub.example.org/ws".into()],
            client_name: "dartplan".into(),
            client_version: "0.1.0".into(),
        },
        connection: ConnectionConfig {
            reconnect_delay_secs: 1,
            ..ConnectionConfig::default()
        },
        tournament: TournamentConfig {
            id: "T-7".into(),
            name: "Club Night".into(),
            description: String::new(),
            callback_url: None,
        },
        credentials: CredentialsConfig::default(),
        db_path: PathBuf::from(":memory:"),
    }
}

#[tokio::test]
async fn inbound_update_is_acknowledged_and_persisted() {
    let connector = Arc::new(MemoryConnector::new());
    let mut peer = connector.push_link();
    let api = Arc::new(RecordingApi::default());
    let store = Arc::new(SqliteStore::open(":memory:").unwrap());
    store.save_tournament(&sample_tournament()).unwrap();

    let config = config();
    let tournament = app::resolve_tournament(&config, &store).unwrap();
    let dyn_connector: Arc<dyn Connector> = connector.clone();
    let dyn_api: Arc<dyn HubApi> = api.clone();
    let hub = app::Hub::new(&config, tournament, dyn_connector, dyn_api);
    let coordinator = Arc::clone(&hub.coordinator);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let dyn_store: Arc<dyn TournamentStore> = store.clone();
    let session = tokio::spawn(app::run(
        hub,
        dyn_store,
        Duration::from_secs(3600),
        async {
            let _ = stop_rx.await;
        },
        true,
    ));

    assert_eq!(next_sent(&mut peer).await["type"], "subscribe-tournament");
    assert_eq!(next_sent(&mut peer).await["type"], "register-planner");
    eventually("registration", || {
        coordinator.state() == HubState::TournamentRegistered
    })
    .await;

    peer.send_text(
        json!({
            "type": "tournament-match-updated",
            "tournamentId": "T-7",
            "matchUpdate": {
                "matchId": 7, "classId": 1, "groupName": "A", "matchType": "Group",
                "player1Sets": 1, "player2Sets": 3, "status": "Finished"
            }
        })
        .to_string(),
    );
    let ack = next_sent(&mut peer).await;
    assert_eq!(ack["type"], "match-update-acknowledged");
    assert_eq!(ack["tournamentId"], "T-7");
    assert_eq!(ack["matchId"], 7);
    assert_eq!(ack["changed"], true);

    let stored = || {
        store
            .load_tournament("T-7")
            .unwrap()
            .map(|t| t.classes[0].groups[0].matches[0].status)
    };
    eventually("class persisted", || stored() == Some(MatchStatus::Finished)).await;

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let loaded = store.load_tournament("T-7").unwrap().unwrap();
    assert_eq!(loaded.classes[0].groups[0].matches[0].winner, Some(2));
    assert!(api.calls().last().unwrap().starts_with("unregister T-7"));
    assert_eq!(coordinator.state(), HubState::Disconnected);
}

#[tokio::test]
async fn stalled_status_heartbeat_does_not_hold_up_the_event_loop() {
    let connector = Arc::new(MemoryConnector::new());
    let mut peer = connector.push_link();
    let api = Arc::new(RecordingApi::default());
    api.stall_heartbeat.store(true, Ordering::SeqCst);
    let store = Arc::new(SqliteStore::open(":memory:").unwrap());
    store.save_tournament(&sample_tournament()).unwrap();

    let config = config();
    let tournament = app::resolve_tournament(&config, &store).unwrap();
    let dyn_connector: Arc<dyn Connector> = connector.clone();
    let dyn_api: Arc<dyn HubApi> = api.clone();
    let hub = app::Hub::new(&config, tournament, dyn_connector, dyn_api);
    let coordinator = Arc::clone(&hub.coordinator);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let dyn_store: Arc<dyn TournamentStore> = store.clone();
    let session = tokio::spawn(app::run(
        hub,
        dyn_store,
        Duration::from_millis(20),
        async {
            let _ = stop_rx.await;
        },
        true,
    ));

    assert_eq!(next_sent(&mut peer).await["type"], "subscribe-tournament");
    assert_eq!(next_sent(&mut peer).await["type"], "register-planner");
    eventually("registration", || {
        coordinator.state() == HubState::TournamentRegistered
    })
    .await;
    eventually("a stalled heartbeat", || {
        api.calls().iter().any(|c| c.starts_with("heartbeat T-7"))
    })
    .await;

    peer.send_text(
        json!({
            "type": "tournament-match-updated",
            "tournamentId": "T-7",
            "matchUpdate": { "matchId": 7, "classId": 1, "player1Sets": 2, "player2Sets": 1 }
        })
        .to_string(),
    );
    assert_eq!(next_sent(&mut peer).await["type"], "match-update-acknowledged");
    let heartbeats = api
        .calls()
        .iter()
        .filter(|c| c.starts_with("heartbeat"))
        .count();
    assert_eq!(heartbeats, 1);

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), session)
        .await
        .expect("shutdown must not wait for the stalled heartbeat")
        .unwrap()
        .unwrap();
    assert!(api.calls().last().unwrap().starts_with("unregister T-7"));
}
