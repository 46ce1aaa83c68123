// Apply a located inbound update to a match without clobbering live play.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::collab::BracketProgression;
use crate::locate::LocatedMatch;
use crate::model::{Match, MatchStatus, PlayerId, TournamentClass};
use crate::update::InboundUpdate;

/// What happened when an update was applied to one match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Any stored field differs from before.
    pub changed: bool,
    /// Status/notes were written (as opposed to suppressed by policy).
    pub status_applied: bool,
    pub became_finished: bool,
    /// The match left Finished; needs manual attention.
    pub reopened: bool,
    /// Corrected scores on a finished match changed its winner. Progression
    /// is not re-run; needs manual attention.
    pub winner_corrected: bool,
    /// A live-progress event for an already finished match was dropped.
    pub stale_dropped: bool,
    pub winner: Option<PlayerId>,
    /// The bracket engine was asked to advance the winner.
    pub progressed: bool,
}

// ---------------------------------------------------------------------------
// Field policy
// ---------------------------------------------------------------------------

/// Apply `update` to `game` under the non-clobbering policy.
///
/// Scores are always overwritten. Status and notes are written only when the
/// update may not erase a live indicator:
/// - a live-progress event only corrects a local status that is not yet
///   InProgress;
/// - a local InProgress status is kept unless the update is a completion;
/// - anything else is applied as sent.
///
/// A live-progress event for a finished match is stale and dropped whole.
pub fn reconcile_match(game: &mut Match, update: &InboundUpdate, now: DateTime<Utc>) -> Reconciliation {
    let mut out = Reconciliation::default();
    let incoming = update.parsed_status();

    if game.scores() == update.scores() && incoming.map_or(true, |s| s == game.status) {
        debug!("display id {}: update already applied", game.display_id);
        return out;
    }

    if game.is_finished() && update.is_live_progress {
        debug!(
            "display id {}: dropping live event for finished match",
            game.display_id
        );
        out.stale_dropped = true;
        return out;
    }

    let before = game.clone();
    (game.sets1, game.sets2, game.legs1, game.legs2) = update.scores();

    let target = if update.is_live_progress {
        (game.status != MatchStatus::InProgress).then_some(MatchStatus::InProgress)
    } else if game.status == MatchStatus::InProgress && !update.is_completion {
        None
    } else if update.is_completion {
        Some(incoming.unwrap_or(MatchStatus::Finished))
    } else {
        Some(incoming.unwrap_or(game.status))
    };

    if let Some(status) = target {
        out.status_applied = true;
        game.status = status;
        if !update.notes.is_empty() {
            game.notes = update.notes.clone();
        }
    } else if before.status == MatchStatus::InProgress {
        debug!(
            "display id {}: keeping live status, update status {:?} suppressed",
            game.display_id, update.status
        );
    }

    if game.status == MatchStatus::InProgress && game.started_at.is_none() {
        game.started_at = Some(now);
    }

    if game.is_finished() && !before.is_finished() {
        if game.ended_at.is_none() {
            game.ended_at = Some(now);
        }
        game.winner = game.determine_winner();
        out.became_finished = true;
        info!(
            "display id {}: finished {}-{} (legs {}-{}), winner {:?}",
            game.display_id, game.sets1, game.sets2, game.legs1, game.legs2, game.winner
        );
    } else if before.is_finished() && !game.is_finished() {
        out.reopened = true;
        warn!(
            "display id {}: moved from Finished to {}, needs manual attention",
            game.display_id, game.status
        );
    } else if game.is_finished() && game.scores() != before.scores() {
        game.winner = game.determine_winner();
        if game.winner != before.winner {
            out.winner_corrected = true;
            warn!(
                "display id {}: corrected result {}-{} changes winner {:?} -> {:?}, needs manual attention",
                game.display_id, game.sets1, game.sets2, before.winner, game.winner
            );
        }
    }

    out.winner = game.winner;
    out.changed = *game != before;
    out
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Applies updates to located matches and triggers bracket progression.
pub struct UpdateReconciler {
    progression: Arc<dyn BracketProgression>,
}

impl UpdateReconciler {
    pub fn new(progression: Arc<dyn BracketProgression>) -> Self {
        UpdateReconciler { progression }
    }

    /// Apply `update` to the match `located` points at.
    ///
    /// Progression runs exactly once, when a knockout match of a class in its
    /// bracket phase newly becomes Finished with a winner.
    pub fn apply(
        &self,
        class: &mut TournamentClass,
        located: &LocatedMatch,
        update: &InboundUpdate,
    ) -> Reconciliation {
        self.apply_at(class, located, update, Utc::now())
    }

    pub fn apply_at(
        &self,
        class: &mut TournamentClass,
        located: &LocatedMatch,
        update: &InboundUpdate,
        now: DateTime<Utc>,
    ) -> Reconciliation {
        let class_id = class.id;
        let Some(game) = class.match_at_mut(located.slot) else {
            warn!(
                "class {}: located slot {}[{}] vanished",
                class_id, located.slot.collection, located.slot.index
            );
            return Reconciliation::default();
        };
        let mut out = reconcile_match(game, update, now);

        if out.became_finished
            && out.winner.is_some()
            && located.slot.is_knockout()
            && class.phase.is_bracket()
        {
            out.progressed = self.progression.advance_winner(class, located.slot);
        }
        out
    }
}
