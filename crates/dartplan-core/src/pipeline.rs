// Shared tournament arena and the locked locate -> identity -> reconcile pipeline.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::collab::UiNotifier;
use crate::identity::{ensure_durable_identity, IdentityRepair};
use crate::locate::{locate, LocateError, LocatedMatch};
use crate::model::{MatchSlot, Tournament, TournamentClass};
use crate::reconcile::{Reconciliation, UpdateReconciler};
use crate::update::InboundUpdate;

/// A tournament whose classes can be locked one at a time.
///
/// Classes are addressed by integer id; each sits behind its own mutex so an
/// inbound update and a local edit to the same class never interleave. The
/// id a class was added under is its key for good, so lookup takes no lock.
pub struct SharedTournament {
    id: String,
    name: String,
    description: String,
    classes: Vec<(u32, Arc<Mutex<TournamentClass>>)>,
}

impl SharedTournament {
    pub fn new(tournament: Tournament) -> Self {
        SharedTournament {
            id: tournament.id,
            name: tournament.name,
            description: tournament.description,
            classes: tournament
                .classes
                .into_iter()
                .map(|c| (c.id, Arc::new(Mutex::new(c))))
                .collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Find a class by id. Id 0 addresses the only class of a single-class
    /// tournament.
    pub fn class(&self, class_id: u32) -> Option<Arc<Mutex<TournamentClass>>> {
        if class_id == 0 && self.classes.len() == 1 {
            return self.classes.first().map(|(_, c)| Arc::clone(c));
        }
        self.classes
            .iter()
            .find(|(id, _)| *id == class_id)
            .map(|(_, c)| Arc::clone(c))
    }

    /// Deep copy of the whole tournament, locking each class in turn.
    pub fn snapshot(&self) -> Tournament {
        Tournament {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            classes: self.classes.iter().map(|(_, c)| lock(c).clone()).collect(),
        }
    }

    pub fn player_count(&self) -> usize {
        self.classes.iter().map(|(_, c)| lock(c).players.len()).sum()
    }

    pub fn active_match_count(&self) -> usize {
        self.classes
            .iter()
            .map(|(_, c)| lock(c).active_match_count())
            .sum()
    }
}

/// Lock a class, recovering the data if a previous holder panicked.
pub fn lock(class: &Mutex<TournamentClass>) -> MutexGuard<'_, TournamentClass> {
    class.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update was resolved; `reconciliation.changed` tells whether it
    /// altered anything.
    Resolved {
        class_id: u32,
        located: LocatedMatch,
        identity: IdentityRepair,
        reconciliation: Reconciliation,
    },
    Unresolved {
        class_id: u32,
        error: LocateError,
    },
}

impl UpdateOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, UpdateOutcome::Resolved { .. })
    }

    pub fn changed(&self) -> bool {
        match self {
            UpdateOutcome::Resolved {
                identity,
                reconciliation,
                ..
            } => reconciliation.changed || !identity.is_empty(),
            UpdateOutcome::Unresolved { .. } => false,
        }
    }

    pub fn slot(&self) -> Option<MatchSlot> {
        match self {
            UpdateOutcome::Resolved { located, .. } => Some(located.slot),
            UpdateOutcome::Unresolved { .. } => None,
        }
    }
}

/// Routes inbound updates through locate, identity repair and reconciliation
/// under the owning class's lock, then signals the UI.
pub struct UpdatePipeline {
    tournament: Arc<SharedTournament>,
    reconciler: UpdateReconciler,
    ui: Arc<dyn UiNotifier>,
}

impl UpdatePipeline {
    pub fn new(
        tournament: Arc<SharedTournament>,
        reconciler: UpdateReconciler,
        ui: Arc<dyn UiNotifier>,
    ) -> Self {
        UpdatePipeline {
            tournament,
            reconciler,
            ui,
        }
    }

    pub fn tournament(&self) -> &Arc<SharedTournament> {
        &self.tournament
    }

    pub fn handle(&self, update: &InboundUpdate) -> UpdateOutcome {
        let Some(class) = self.tournament.class(update.class_id) else {
            warn!(
                "update for display id {} addressed to unknown class {}",
                update.numeric_match_id, update.class_id
            );
            return UpdateOutcome::Unresolved {
                class_id: update.class_id,
                error: LocateError::ClassNotFound {
                    class_id: update.class_id,
                },
            };
        };

        let outcome = {
            let mut guard = lock(&class);
            let class_id = guard.id;
            match locate(update, &guard) {
                Ok(located) => {
                    let identity =
                        ensure_durable_identity(&mut guard, located.slot, update.durable_id());
                    let reconciliation = self.reconciler.apply(&mut guard, &located, update);
                    if reconciliation.changed {
                        info!(
                            "class {}: applied update to display id {} via {}",
                            class_id, update.numeric_match_id, located.resolved_by
                        );
                    }
                    UpdateOutcome::Resolved {
                        class_id,
                        located,
                        identity,
                        reconciliation,
                    }
                }
                Err(error) => {
                    warn!("class {}: update dropped: {}", class_id, error);
                    UpdateOutcome::Unresolved { class_id, error }
                }
            }
        };

        let class_id = match &outcome {
            UpdateOutcome::Resolved { class_id, .. } | UpdateOutcome::Unresolved { class_id, .. } => {
                *class_id
            }
        };
        self.ui.notify_changed(class_id);
        outcome
    }
}
