// Durable match identity: stamping, generation and duplicate repair.

use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{MatchSlot, TournamentClass};

/// What `ensure_durable_identity` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRepair {
    /// The id written onto the located match, if it changed.
    pub stamped: Option<String>,
    /// Other matches that held the same id and were given a fresh one.
    pub reassigned: Vec<(MatchSlot, String)>,
}

impl IdentityRepair {
    pub fn is_empty(&self) -> bool {
        self.stamped.is_none() && self.reassigned.is_empty()
    }
}

pub fn generate_durable_id() -> String {
    Uuid::new_v4().to_string()
}

/// Make sure the match at `slot` carries a durable id and is its only holder
/// within the class.
///
/// A non-empty `hinted` id (from the Hub) is stamped onto the match when the
/// match lacks one or carries a different one. Without a hint, a match with no
/// id gets a generated one. Any other match of the class already carrying the
/// final id is reassigned a freshly generated id.
pub fn ensure_durable_identity(
    class: &mut TournamentClass,
    slot: MatchSlot,
    hinted: Option<&str>,
) -> IdentityRepair {
    let mut repair = IdentityRepair::default();
    let class_id = class.id;
    let Some(game) = class.match_at_mut(slot) else {
        return repair;
    };

    let hinted = hinted.map(str::trim).filter(|id| !id.is_empty());
    let wanted = match (hinted, game.durable_id.as_deref()) {
        (Some(hint), current) if current != Some(hint) => Some(hint.to_string()),
        (None, None) => Some(generate_durable_id()),
        _ => None,
    };
    if let Some(id) = wanted {
        match game.durable_id.as_deref() {
            Some(old) => warn!(
                "class {}: replacing durable id {} of display id {} with {}",
                class_id, old, game.display_id, id
            ),
            None => info!(
                "class {}: stamping durable id {} onto display id {}",
                class_id, id, game.display_id
            ),
        }
        game.durable_id = Some(id.clone());
        repair.stamped = Some(id);
    }

    let Some(id) = game.durable_id.clone() else {
        return repair;
    };

    let duplicates: Vec<MatchSlot> = class
        .all_matches()
        .into_iter()
        .filter(|(other, m)| *other != slot && m.durable_id.as_deref() == Some(id.as_str()))
        .map(|(other, _)| other)
        .collect();

    for other in duplicates {
        if let Some(m) = class.match_at_mut(other) {
            let fresh = generate_durable_id();
            warn!(
                "class {}: duplicate durable id {} on display id {} ({}), reassigned {}",
                class_id, id, m.display_id, other.collection, fresh
            );
            m.durable_id = Some(fresh.clone());
            repair.reassigned.push((other, fresh));
        }
    }

    repair
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Collection, Group, KnockoutMatch, Match};

    fn sample_class() -> TournamentClass {
        let mut class = TournamentClass::new(1, "Open");
        let mut a = Group::new(1, "A");
        a.matches.push(Match::new(1, 1, Some(2)));
        a.matches.push(Match::new(2, 1, Some(3)).with_durable_id("keep-me"));
        class.groups.push(a);
        class
            .winner_bracket
            .push(KnockoutMatch::new(Match::new(1, 2, Some(3)).with_durable_id("hub-1"), 1));
        class
    }

    const FIRST: MatchSlot = MatchSlot {
        collection: Collection::Group(0),
        index: 0,
    };

    #[test]
    fn stamps_hinted_id_on_missing_identity() {
        let mut class = sample_class();
        let repair = ensure_durable_identity(&mut class, FIRST, Some("abc"));
        assert_eq!(repair.stamped.as_deref(), Some("abc"));
        assert!(repair.reassigned.is_empty());
        assert_eq!(class.groups[0].matches[0].durable_id.as_deref(), Some("abc"));
    }

    #[test]
    fn generates_id_when_no_hint() {
        let mut class = sample_class();
        let repair = ensure_durable_identity(&mut class, FIRST, None);
        let id = repair.stamped.expect("an id is generated");
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(class.groups[0].matches[0].durable_id, Some(id));
    }

    #[test]
    fn matching_id_is_left_alone() {
        let mut class = sample_class();
        let slot = MatchSlot::new(Collection::Group(0), 1);
        let repair = ensure_durable_identity(&mut class, slot, Some("keep-me"));
        assert!(repair.is_empty());

        let repair = ensure_durable_identity(&mut class, slot, Some("  "));
        assert!(repair.is_empty());
        assert_eq!(class.groups[0].matches[1].durable_id.as_deref(), Some("keep-me"));
    }

    #[test]
    fn duplicate_holder_gets_fresh_id() {
        let mut class = sample_class();
        let repair = ensure_durable_identity(&mut class, FIRST, Some("hub-1"));
        assert_eq!(repair.stamped.as_deref(), Some("hub-1"));
        assert_eq!(repair.reassigned.len(), 1);

        let (slot, fresh) = &repair.reassigned[0];
        assert_eq!(*slot, MatchSlot::new(Collection::WinnerBracket, 0));
        assert_ne!(fresh, "hub-1");
        assert_eq!(class.winner_bracket[0].game.durable_id.as_ref(), Some(fresh));

        let holders = class
            .all_matches()
            .into_iter()
            .filter(|(_, m)| m.durable_id.as_deref() == Some("hub-1"))
            .count();
        assert_eq!(holders, 1);
    }

    #[test]
    fn missing_slot_is_a_no_op() {
        let mut class = sample_class();
        let repair = ensure_durable_identity(&mut class, MatchSlot::new(Collection::Finals, 0), Some("x"));
        assert!(repair.is_empty());
    }
}
