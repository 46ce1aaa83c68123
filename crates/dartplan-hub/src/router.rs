// MessageRouter: parse inbound frames, dispatch by kind, acknowledge match updates.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dartplan_core::pipeline::{UpdateOutcome, UpdatePipeline};
use dartplan_core::update::InboundUpdate;

use crate::connection::HubSender;
use crate::protocol::{InboundMessage, OutboundMessage};

/// What the rest of the application hears from the Hub.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Welcome {
        client_id: Option<String>,
    },
    SubscriptionConfirmed {
        tournament_id: Option<String>,
    },
    PlannerRegistrationConfirmed {
        tournament_id: Option<String>,
        success: bool,
    },
    MatchUpdate(UpdateOutcome),
    HeartbeatAck,
    HubError {
        message: String,
    },
}

pub struct MessageRouter {
    pipeline: Arc<UpdatePipeline>,
    sender: Arc<dyn HubSender>,
    events: mpsc::Sender<HubEvent>,
}

impl MessageRouter {
    pub fn new(
        pipeline: Arc<UpdatePipeline>,
        sender: Arc<dyn HubSender>,
        events: mpsc::Sender<HubEvent>,
    ) -> Self {
        MessageRouter {
            pipeline,
            sender,
            events,
        }
    }

    /// Route frames until the inbound channel closes.
    pub async fn run(self, mut inbound: mpsc::Receiver<String>) {
        while let Some(raw) = inbound.recv().await {
            self.route(&raw).await;
        }
        debug!("inbound channel closed, router stopping");
    }

    /// Handle one raw text frame. Malformed or unknown messages are logged
    /// and dropped.
    pub async fn route(&self, raw: &str) {
        let message = match InboundMessage::parse(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!("dropping hub message: {e}");
                return;
            }
        };
        debug!("routing {}", message.kind());

        let event = match message {
            InboundMessage::Welcome { client_id } => {
                info!("hub welcome (client id: {})", client_id.as_deref().unwrap_or("-"));
                HubEvent::Welcome { client_id }
            }
            InboundMessage::SubscriptionConfirmed { tournament_id } => {
                info!("subscription confirmed for {}", tournament_id.as_deref().unwrap_or("-"));
                HubEvent::SubscriptionConfirmed { tournament_id }
            }
            InboundMessage::PlannerRegistrationConfirmed {
                tournament_id,
                success,
            } => {
                if success {
                    info!("planner registration confirmed");
                } else {
                    warn!("hub rejected planner registration");
                }
                HubEvent::PlannerRegistrationConfirmed {
                    tournament_id,
                    success,
                }
            }
            InboundMessage::MatchUpdate {
                tournament_id,
                update,
            } => match self.handle_match_update(tournament_id, &update).await {
                Some(outcome) => HubEvent::MatchUpdate(outcome),
                None => return,
            },
            InboundMessage::HeartbeatAck => HubEvent::HeartbeatAck,
            InboundMessage::Error { message } => {
                warn!("hub reported error: {message}");
                HubEvent::HubError { message }
            }
        };

        if self.events.send(event).await.is_err() {
            debug!("hub event receiver dropped");
        }
    }

    /// Apply an update and acknowledge it, found or not. Updates addressed to
    /// another tournament are refused without touching local state.
    async fn handle_match_update(
        &self,
        tournament_id: Option<String>,
        update: &InboundUpdate,
    ) -> Option<UpdateOutcome> {
        let own_id = self.pipeline.tournament().id();
        let tournament_id = tournament_id.unwrap_or_else(|| own_id.to_string());

        if tournament_id != own_id {
            warn!(
                "update for display id {} addressed to tournament {tournament_id}, not {own_id}",
                update.numeric_match_id
            );
            self.acknowledge(OutboundMessage::MatchUpdateError {
                tournament_id,
                match_id: update.numeric_match_id,
                match_uuid: update.durable_id().map(str::to_string),
                timestamp: Utc::now(),
                error: "tournament mismatch".into(),
            })
            .await;
            return None;
        }

        let outcome = self.pipeline.handle(update);
        let ack = match &outcome {
            UpdateOutcome::Resolved { .. } => OutboundMessage::MatchUpdateAcknowledged {
                tournament_id,
                match_id: update.numeric_match_id,
                match_uuid: update.durable_id().map(str::to_string),
                timestamp: Utc::now(),
                changed: outcome.changed(),
            },
            UpdateOutcome::Unresolved { error, .. } => OutboundMessage::MatchUpdateError {
                tournament_id,
                match_id: update.numeric_match_id,
                match_uuid: update.durable_id().map(str::to_string),
                timestamp: Utc::now(),
                error: error.to_string(),
            },
        };
        self.acknowledge(ack).await;
        Some(outcome)
    }

    async fn acknowledge(&self, ack: OutboundMessage) {
        if let Err(e) = self.sender.send(&ack).await {
            warn!("could not send {}: {e}", ack.kind());
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use dartplan_core::collab::{NoProgression, UiNotifier};
    use dartplan_core::locate::LocateError;
    use dartplan_core::model::{Group, Match, MatchStatus, Tournament, TournamentClass};
    use dartplan_core::pipeline::{lock, SharedTournament};
    use dartplan_core::reconcile::UpdateReconciler;
    use serde_json::json;

    use crate::transport::ConnectionError;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl HubSender for RecordingSender {
        async fn send(&self, message: &OutboundMessage) -> Result<(), ConnectionError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    struct NullUi;

    impl UiNotifier for NullUi {
        fn notify_changed(&self, _class_id: u32) {}
    }

    fn router() -> (MessageRouter, Arc<RecordingSender>, mpsc::Receiver<HubEvent>) {
        let mut class = TournamentClass::new(1, "Open");
        let mut group = Group::new(1, "A");
        group.matches.push(Match::new(7, 1, Some(2)));
        class.groups.push(group);
        let mut t = Tournament::new("T-1", "Club Night");
        t.classes.push(class);

        let pipeline = Arc::new(UpdatePipeline::new(
            Arc::new(SharedTournament::new(t)),
            UpdateReconciler::new(Arc::new(NoProgression)),
            Arc::new(NullUi),
        ));
        let sender = Arc::new(RecordingSender::default());
        let (tx, rx) = mpsc::channel(16);
        (MessageRouter::new(pipeline, sender.clone(), tx), sender, rx)
    }

    fn update_frame(tournament_id: &str, match_id: u32) -> String {
        json!({
            "type": "tournament-match-updated",
            "tournamentId": tournament_id,
            "matchUpdate": {
                "matchId": match_id.to_string(),
                "classId": 1,
                "result": { "player1Sets": 3, "player2Sets": 1, "status": "Finished" }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn resolved_update_is_applied_and_acknowledged() {
        let (router, sender, mut events) = router();
        router.route(&update_frame("T-1", 7)).await;

        let sent = sender.sent.lock().unwrap().clone();
        match sent.as_slice() {
            [OutboundMessage::MatchUpdateAcknowledged {
                tournament_id,
                match_id,
                changed,
                ..
            }] => {
                assert_eq!(tournament_id, "T-1");
                assert_eq!(*match_id, 7);
                assert!(*changed);
            }
            other => panic!("expected one acknowledgment, got {other:?}"),
        }

        match events.try_recv().unwrap() {
            HubEvent::MatchUpdate(outcome) => assert!(outcome.is_resolved()),
            other => panic!("expected MatchUpdate event, got {other:?}"),
        }
        let class = router.pipeline.tournament().class(1).unwrap();
        assert_eq!(lock(&class).groups[0].matches[0].status, MatchStatus::Finished);
    }

    #[tokio::test]
    async fn unresolved_update_gets_error_acknowledgment() {
        let (router, sender, mut events) = router();
        router.route(&update_frame("T-1", 99)).await;

        let sent = sender.sent.lock().unwrap().clone();
        match sent.as_slice() {
            [OutboundMessage::MatchUpdateError {
                match_id, error, ..
            }] => {
                assert_eq!(*match_id, 99);
                assert!(error.contains("99"));
            }
            other => panic!("expected one error acknowledgment, got {other:?}"),
        }
        assert!(matches!(
            events.try_recv().unwrap(),
            HubEvent::MatchUpdate(UpdateOutcome::Unresolved {
                error: LocateError::NotFound { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn foreign_tournament_update_is_refused() {
        let (router, sender, mut events) = router();
        router.route(&update_frame("T-other", 7)).await;

        let sent = sender.sent.lock().unwrap().clone();
        assert!(matches!(
            sent.as_slice(),
            [OutboundMessage::MatchUpdateError { error, .. }] if error == "tournament mismatch"
        ));
        assert!(events.try_recv().is_err());
        let class = router.pipeline.tournament().class(1).unwrap();
        assert_eq!(lock(&class).groups[0].matches[0].status, MatchStatus::NotStarted);
    }

    #[tokio::test]
    async fn malformed_and_unknown_messages_are_dropped() {
        let (router, sender, mut events) = router();
        router.route("{not json").await;
        router.route(r#"{"type":"tournament-deleted"}"#).await;
        router.route(r#"{"no":"type"}"#).await;

        assert!(sender.sent.lock().unwrap().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn control_messages_become_events() {
        let (router, sender, mut events) = router();
        router.route(r#"{"type":"welcome","clientId":"c-1"}"#).await;
        router.route(r#"{"type":"heartbeat-ack"}"#).await;
        router.route(r#"{"type":"error","message":"quota"}"#).await;

        assert_eq!(
            events.try_recv().unwrap(),
            HubEvent::Welcome {
                client_id: Some("c-1".into())
            }
        );
        assert_eq!(events.try_recv().unwrap(), HubEvent::HeartbeatAck);
        assert_eq!(
            events.try_recv().unwrap(),
            HubEvent::HubError {
                message: "quota".into()
            }
        );
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_drains_inbound_channel() {
        let (router, sender, _events) = router();
        let (tx, rx) = mpsc::channel(4);
        tx.send(update_frame("T-1", 7)).await.unwrap();
        drop(tx);
        router.run(rx).await;
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }
}
