// Application wiring: tournament resolution, component assembly and the
// main event loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dartplan_core::collab::{SuccessorLinkProgression, TournamentStore, UiNotifier};
use dartplan_core::identity::generate_durable_id;
use dartplan_core::model::Tournament;
use dartplan_core::pipeline::{lock, SharedTournament, UpdateOutcome, UpdatePipeline};
use dartplan_core::reconcile::UpdateReconciler;
use dartplan_core::store::SqliteStore;

use crate::api::HubApi;
use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionSettings, HubSender};
use crate::registration::{ClientInfo, RegistrationCoordinator};
use crate::router::{HubEvent, MessageRouter};
use crate::transport::{endpoints_from, Connector};

/// UI refresh signal delivered as class ids on a channel, for whichever
/// task owns presentation state.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<u32>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<u32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelNotifier { tx }, rx)
    }
}

impl UiNotifier for ChannelNotifier {
    fn notify_changed(&self, class_id: u32) {
        if self.tx.send(class_id).is_err() {
            debug!("ui refresh for class {class_id} dropped, no receiver");
        }
    }
}

/// Pick the tournament to serve: the configured id, else the most recently
/// stored one, else a new tournament under a generated id. Name and
/// description always come from the configuration.
pub fn resolve_tournament(config: &Config, store: &SqliteStore) -> Result<Tournament> {
    let configured = config.tournament.id.trim();
    let id = if !configured.is_empty() {
        configured.to_string()
    } else if let Some(latest) = store
        .tournament_ids()
        .context("failed to list stored tournaments")?
        .into_iter()
        .next()
    {
        latest
    } else {
        generate_durable_id()
    };

    let mut tournament = match store
        .load_tournament(&id)
        .with_context(|| format!("failed to load tournament {id}"))?
    {
        Some(t) => {
            info!("loaded tournament {id} with {} classes", t.classes.len());
            t
        }
        None => {
            info!("starting new tournament {id}");
            Tournament::new(id, config.tournament.name.clone())
        }
    };
    tournament.name = config.tournament.name.clone();
    tournament.description = config.tournament.description.clone();
    store
        .save_tournament(&tournament)
        .context("failed to save tournament")?;
    Ok(tournament)
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// All long-lived components plus the channels that connect them.
pub struct Hub {
    pub pipeline: Arc<UpdatePipeline>,
    pub connection: Arc<ConnectionManager>,
    pub coordinator: Arc<RegistrationCoordinator>,
    router: MessageRouter,
    inbound_rx: mpsc::Receiver<String>,
    events_rx: mpsc::Receiver<HubEvent>,
    ui_rx: mpsc::UnboundedReceiver<u32>,
}

impl Hub {
    pub fn new(
        config: &Config,
        tournament: Tournament,
        connector: Arc<dyn Connector>,
        api: Arc<dyn HubApi>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (notifier, ui_rx) = ChannelNotifier::new();

        let shared = Arc::new(SharedTournament::new(tournament));
        let pipeline = Arc::new(UpdatePipeline::new(
            Arc::clone(&shared),
            UpdateReconciler::new(Arc::new(SuccessorLinkProgression)),
            Arc::new(notifier),
        ));

        let connection = ConnectionManager::new(
            endpoints_from(&config.hub, &config.connection),
            connector,
            ConnectionSettings::from_config(&config.connection),
            inbound_tx,
        );
        let coordinator = RegistrationCoordinator::new(
            Arc::clone(&connection),
            api,
            shared,
            ClientInfo {
                name: config.hub.client_name.clone(),
                version: config.hub.client_version.clone(),
                callback_url: config.tournament.callback_url.clone(),
            },
        );
        let sender: Arc<dyn HubSender> = connection.clone();
        let router = MessageRouter::new(Arc::clone(&pipeline), sender, events_tx);

        Hub {
            pipeline,
            connection,
            coordinator,
            router,
            inbound_rx,
            events_rx,
            ui_rx,
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Run until `shutdown` resolves: register with the Hub, persist classes
/// changed by inbound updates, and send the periodic status heartbeat.
pub async fn run<F>(
    hub: Hub,
    store: Arc<dyn TournamentStore>,
    status_interval: Duration,
    shutdown: F,
    unregister_on_exit: bool,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let Hub {
        pipeline,
        connection: _,
        coordinator,
        router,
        inbound_rx,
        mut events_rx,
        mut ui_rx,
    } = hub;

    let router_handle = tokio::spawn(router.run(inbound_rx));
    let state_handle = coordinator.start();
    let registering = Arc::clone(&coordinator);
    let register_handle = tokio::spawn(async move { registering.register().await });

    let mut status = tokio::time::interval(status_interval);
    status.tick().await;
    // At most one heartbeat in flight; it never holds up the loop.
    let mut heartbeat: Option<JoinHandle<()>> = None;
    tokio::pin!(shutdown);

    info!("event loop started for tournament {}", coordinator.tournament_id());
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            Some(event) = events_rx.recv() => {
                handle_event(&pipeline, store.as_ref(), &coordinator, event);
            }
            Some(class_id) = ui_rx.recv() => {
                debug!("class {class_id} needs redraw");
            }
            _ = status.tick() => {
                if heartbeat.as_ref().is_some_and(|h| !h.is_finished()) {
                    debug!("previous status heartbeat still in flight, skipping");
                    continue;
                }
                let reporting = Arc::clone(&coordinator);
                heartbeat = Some(tokio::spawn(async move {
                    if let Err(e) = reporting.report_status().await {
                        warn!("status heartbeat failed: {e}");
                    }
                }));
            }
        }
    }

    register_handle.abort();
    if let Some(pending) = heartbeat.take() {
        pending.abort();
    }
    coordinator.shutdown(unregister_on_exit).await;
    router_handle.abort();
    state_handle.abort();

    if let Err(e) = store.save_tournament(&pipeline.tournament().snapshot()) {
        error!("final save failed: {e:#}");
    }
    Ok(())
}

fn handle_event(
    pipeline: &UpdatePipeline,
    store: &dyn TournamentStore,
    coordinator: &RegistrationCoordinator,
    event: HubEvent,
) {
    match event {
        HubEvent::Welcome { client_id } => coordinator.set_client_id(client_id),
        HubEvent::MatchUpdate(outcome) if outcome.changed() => {
            if let UpdateOutcome::Resolved { class_id, .. } = outcome {
                persist_class(pipeline, store, class_id);
            }
        }
        HubEvent::PlannerRegistrationConfirmed { success: false, .. } => {
            warn!("planner registration rejected, will retry on next reconnect");
        }
        _ => {}
    }
}

fn persist_class(pipeline: &UpdatePipeline, store: &dyn TournamentStore, class_id: u32) {
    let Some(class) = pipeline.tournament().class(class_id) else {
        return;
    };
    let snapshot = lock(&class).clone();
    if let Err(e) = store.save_class(pipeline.tournament().id(), &snapshot) {
        error!("failed to persist class {class_id}: {e:#}");
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use dartplan_core::model::TournamentClass;

    use crate::config::{ConnectionConfig, CredentialsConfig, HubConfig, TournamentConfig};

    fn config(id: &str) -> Config {
        Config {
            hub: HubConfig {
                api_base_url: "https://hub.example.org".into(),
                endpoints: vec!["ws://hub.example.org/ws".into()],
                client_name: "dartplan".into(),
                client_version: "0.1.0".into(),
            },
            connection: ConnectionConfig::default(),
            tournament: TournamentConfig {
                id: id.into(),
                name: "Club Night".into(),
                description: "501 double out".into(),
                callback_url: None,
            },
            credentials: CredentialsConfig::default(),
            db_path: PathBuf::from(":memory:"),
        }
    }

    #[test]
    fn channel_notifier_forwards_class_ids() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify_changed(3);
        notifier.notify_changed(1);
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert_eq!(rx.try_recv().unwrap(), 1);
        drop(rx);
        notifier.notify_changed(2);
    }

    #[test]
    fn configured_id_is_used_and_created() {
        let store = SqliteStore::open(":memory:").unwrap();
        let t = resolve_tournament(&config("T-5"), &store).unwrap();
        assert_eq!(t.id, "T-5");
        assert_eq!(t.description, "501 double out");
        assert_eq!(store.tournament_ids().unwrap(), vec!["T-5".to_string()]);
    }

    #[test]
    fn stored_tournament_is_reused_when_no_id_configured() {
        let store = SqliteStore::open(":memory:").unwrap();
        let mut existing = Tournament::new("T-old", "Old name");
        existing.classes.push(TournamentClass::new(1, "Open"));
        store.save_tournament(&existing).unwrap();

        let t = resolve_tournament(&config(""), &store).unwrap();
        assert_eq!(t.id, "T-old");
        assert_eq!(t.name, "Club Night");
        assert_eq!(t.classes.len(), 1);
    }

    #[test]
    fn fresh_store_generates_and_keeps_an_id() {
        let store = SqliteStore::open(":memory:").unwrap();
        let first = resolve_tournament(&config(""), &store).unwrap();
        assert!(!first.id.is_empty());
        let second = resolve_tournament(&config(""), &store).unwrap();
        assert_eq!(first.id, second.id);
    }
}
