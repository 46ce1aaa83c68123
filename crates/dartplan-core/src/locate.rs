// Match identity resolution: map one inbound update to exactly one local match.
//
// Passes run in order and stop at the first success:
//   1. durable id, inside the hinted collections (or everywhere without a hint)
//   2. display id, inside the same collections, with player-name tie-breaking
//   3. scoping: a phase hint plus a non-zero display id never falls back
//   4. fallback walk over every collection in fixed order
//
// The locator is read-only. Stamping or repairing durable ids on the located
// match is the caller's job (see `identity::ensure_durable_identity`).

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::model::{Collection, Match, MatchSlot, TournamentClass};
use crate::update::{InboundUpdate, MatchTypeHint};

/// Which pass produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBy {
    DurableId,
    NumericId,
    PlayerNames,
    Fallback,
}

impl fmt::Display for ResolvedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolvedBy::DurableId => "durable id",
            ResolvedBy::NumericId => "display id",
            ResolvedBy::PlayerNames => "player names",
            ResolvedBy::Fallback => "fallback search",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedMatch {
    pub slot: MatchSlot,
    pub resolved_by: ResolvedBy,
    /// Owning group name for group and finals matches.
    pub group_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocateError {
    #[error("tournament class {class_id} not found")]
    ClassNotFound { class_id: u32 },

    #[error("no match for display id {display_id} (searched {})", join(searched))]
    NotFound {
        display_id: u32,
        searched: Vec<Collection>,
    },

    #[error("display id {display_id} matches {} entries and player names do not single one out", candidates.len())]
    Ambiguous {
        display_id: u32,
        candidates: Vec<MatchSlot>,
    },

    #[error("display id {display_id} not found in hinted phase (searched {})", join(searched))]
    ScopedMiss {
        display_id: u32,
        searched: Vec<Collection>,
    },
}

fn join(collections: &[Collection]) -> String {
    if collections.is_empty() {
        return "nothing".to_string();
    }
    collections
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

/// Resolve `update` to a single match of `class`.
pub fn locate(update: &InboundUpdate, class: &TournamentClass) -> Result<LocatedMatch, LocateError> {
    let hinted = hinted_collections(update, class);
    let targets = hinted.clone().unwrap_or_else(|| class.collections());
    let numeric = update.numeric_match_id;

    let found = |slot: MatchSlot, resolved_by: ResolvedBy| {
        debug!(
            "class {}: update for display id {} resolved by {} to {}[{}]",
            class.id, numeric, resolved_by, slot.collection, slot.index
        );
        Ok(LocatedMatch {
            slot,
            resolved_by,
            group_name: class.group_name(slot).map(str::to_string),
        })
    };

    // 1. Durable id.
    if let Some(durable) = update.durable_id() {
        let holders: Vec<MatchSlot> = matches_where(class, &targets, |m| {
            m.durable_id.as_deref() == Some(durable)
        });
        match holders.as_slice() {
            [only] => return found(*only, ResolvedBy::DurableId),
            [] => {}
            many => {
                // Duplicate durable id; the display id picks the real holder.
                let by_display: Vec<MatchSlot> = many
                    .iter()
                    .copied()
                    .filter(|slot| {
                        class
                            .match_at(*slot)
                            .is_some_and(|m| numeric != 0 && m.display_id == numeric)
                    })
                    .collect();
                if let [only] = by_display.as_slice() {
                    return found(*only, ResolvedBy::DurableId);
                }
            }
        }
    }

    // 2. Display id.
    if numeric != 0 {
        let candidates = matches_where(class, &targets, |m| m.display_id == numeric);
        match candidates.as_slice() {
            [only] => return found(*only, ResolvedBy::NumericId),
            [] => {}
            many => {
                return match disambiguate_by_names(update, class, many) {
                    Some(slot) => found(slot, ResolvedBy::PlayerNames),
                    None => Err(LocateError::Ambiguous {
                        display_id: numeric,
                        candidates: many.to_vec(),
                    }),
                };
            }
        }
    }

    // 3. Scoping.
    if let Some(searched) = hinted {
        if numeric != 0 {
            return Err(LocateError::ScopedMiss {
                display_id: numeric,
                searched,
            });
        }
    }

    // 4. Fallback over every collection, durable id before display id.
    let order = class.collections();
    for collection in &order {
        let games = class.matches_in(*collection);
        let by_durable = update.durable_id().and_then(|durable| {
            games
                .iter()
                .find(|(_, m)| m.durable_id.as_deref() == Some(durable))
        });
        let by_display = || {
            games
                .iter()
                .find(|(_, m)| numeric != 0 && m.display_id == numeric)
        };
        if let Some((slot, _)) = by_durable.or_else(by_display) {
            return found(*slot, ResolvedBy::Fallback);
        }
    }

    Err(LocateError::NotFound {
        display_id: numeric,
        searched: order,
    })
}

/// The collections an update is explicitly addressed to, or `None` when the
/// update carries no phase hint at all.
///
/// A hint that names something the class does not have yields an empty list
/// rather than `None`, so the scoping rule still applies.
pub fn hinted_collections(update: &InboundUpdate, class: &TournamentClass) -> Option<Vec<Collection>> {
    let present = class.collections();
    let has = |c: Collection| present.contains(&c);

    let hint = match update.match_type {
        Some(hint) => hint,
        None if update.group_name.is_some() || update.group_id.is_some() => MatchTypeHint::Group,
        None => return None,
    };

    let out = match hint {
        MatchTypeHint::Group => class
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| update.group_id.map_or(true, |id| g.id == id))
            .filter(|(_, g)| {
                update
                    .group_name
                    .as_deref()
                    .map_or(true, |name| g.name.trim().eq_ignore_ascii_case(name.trim()))
            })
            .map(|(idx, _)| Collection::Group(idx))
            .collect(),
        MatchTypeHint::Finals => [Collection::Finals].into_iter().filter(|c| has(*c)).collect(),
        MatchTypeHint::WinnerBracket => [Collection::WinnerBracket]
            .into_iter()
            .filter(|c| has(*c))
            .collect(),
        MatchTypeHint::LoserBracket => [Collection::LoserBracket]
            .into_iter()
            .filter(|c| has(*c))
            .collect(),
    };
    Some(out)
}

fn matches_where(
    class: &TournamentClass,
    collections: &[Collection],
    pred: impl Fn(&Match) -> bool,
) -> Vec<MatchSlot> {
    collections
        .iter()
        .flat_map(|c| class.matches_in(*c))
        .filter(|(_, m)| pred(m))
        .map(|(slot, _)| slot)
        .collect()
}

/// Pick the one candidate whose players carry the update's player names.
/// Names compare case-insensitively and in either order.
fn disambiguate_by_names(
    update: &InboundUpdate,
    class: &TournamentClass,
    candidates: &[MatchSlot],
) -> Option<MatchSlot> {
    let (first, second) = update.player_names.as_ref()?;
    let same = |a: Option<&str>, b: &str| a.is_some_and(|a| a.trim().eq_ignore_ascii_case(b.trim()));

    let hits: Vec<MatchSlot> = candidates
        .iter()
        .copied()
        .filter(|slot| {
            let Some(m) = class.match_at(*slot) else {
                return false;
            };
            let p1 = class.player_name(m.player1);
            let p2 = m.player2.and_then(|id| class.player_name(id));
            (same(p1, first) && same(p2, second)) || (same(p1, second) && same(p2, first))
        })
        .collect();

    match hits.as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
