// Collaborator interfaces the synchronization core calls out to, plus the
// stock implementations the binary runs with.

use anyhow::Result;
use tracing::{info, warn};

use crate::model::{MatchSlot, MatchStatus, PlayerSlot, Tournament, TournamentClass};

/// Advances a knockout winner into the next round.
pub trait BracketProgression: Send + Sync {
    /// Called once when the knockout match at `slot` newly becomes Finished
    /// with a winner. Returns whether anything advanced.
    fn advance_winner(&self, class: &mut TournamentClass, slot: MatchSlot) -> bool;
}

/// Tells whoever owns presentation state that a class needs redrawing.
pub trait UiNotifier: Send + Sync {
    fn notify_changed(&self, class_id: u32);
}

/// Loads and saves the tournament tree.
pub trait TournamentStore: Send + Sync {
    fn load_tournament(&self, tournament_id: &str) -> Result<Option<Tournament>>;
    fn save_tournament(&self, tournament: &Tournament) -> Result<()>;
    fn save_class(&self, tournament_id: &str, class: &TournamentClass) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Stock implementations
// ---------------------------------------------------------------------------

/// Progression that follows each knockout match's `advances_to` link.
#[derive(Debug, Default, Clone, Copy)]
pub struct SuccessorLinkProgression;

impl BracketProgression for SuccessorLinkProgression {
    fn advance_winner(&self, class: &mut TournamentClass, slot: MatchSlot) -> bool {
        let class_id = class.id;
        let Some(knockout) = class.knockout_at(slot) else {
            return false;
        };
        let Some(winner) = knockout.game.winner else {
            return false;
        };
        let Some(link) = knockout.advances_to else {
            info!(
                "class {}: display id {} has no successor, winner {} stays",
                class_id, knockout.game.display_id, winner
            );
            return false;
        };

        let Some(next) = class
            .bracket_mut(link.side)
            .iter_mut()
            .find(|k| k.game.display_id == link.display_id)
        else {
            warn!(
                "class {}: successor display id {} missing from {:?} bracket",
                class_id, link.display_id, link.side
            );
            return false;
        };

        match link.slot {
            PlayerSlot::First => next.game.player1 = winner,
            PlayerSlot::Second => {
                next.game.player2 = Some(winner);
                if next.game.status == MatchStatus::Bye {
                    next.game.status = MatchStatus::NotStarted;
                }
            }
        }
        info!(
            "class {}: player {} advanced to display id {} ({:?} slot)",
            class_id, winner, link.display_id, link.slot
        );
        true
    }
}

/// Progression that does nothing, for callers without a bracket engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgression;

impl BracketProgression for NoProgression {
    fn advance_winner(&self, _class: &mut TournamentClass, _slot: MatchSlot) -> bool {
        false
    }
}
