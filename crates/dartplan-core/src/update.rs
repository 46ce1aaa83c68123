// Inbound match-update envelope as extracted from a Hub message.

use serde_json::Value;

use crate::fields::Candidates;
use crate::model::MatchStatus;

/// Which phase collection the Hub says a match belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTypeHint {
    Group,
    Finals,
    WinnerBracket,
    LoserBracket,
}

impl MatchTypeHint {
    /// Parse the Hub's `matchType` string. Unknown values are treated as no
    /// hint at all.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "group" | "groupphase" | "roundrobin" => Some(MatchTypeHint::Group),
            "finals" | "final" | "finalsphase" | "finalround" => Some(MatchTypeHint::Finals),
            "winnerbracket" | "winner" | "wb" | "knockout" | "knockoutwb" => {
                Some(MatchTypeHint::WinnerBracket)
            }
            "loserbracket" | "loser" | "lb" | "knockoutlb" => Some(MatchTypeHint::LoserBracket),
            _ => None,
        }
    }
}

/// Ephemeral, message-derived description of one match update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundUpdate {
    /// Collection-scoped display id; 0 when missing.
    pub numeric_match_id: u32,
    pub durable_match_id: Option<String>,
    /// 0 when missing.
    pub class_id: u32,
    pub group_id: Option<u32>,
    pub group_name: Option<String>,
    pub match_type: Option<MatchTypeHint>,
    pub sets1: u32,
    pub sets2: u32,
    pub legs1: u32,
    pub legs2: u32,
    /// Raw status string; empty when missing.
    pub status: String,
    pub notes: String,
    /// Match started or a mid-match leg update, and not a completion.
    pub is_live_progress: bool,
    pub is_completion: bool,
    /// Player names carried by the update, used to disambiguate display ids.
    pub player_names: Option<(String, String)>,
}

impl InboundUpdate {
    /// Extract an update from a `tournament-match-updated` message.
    ///
    /// Never fails: every field falls back to zero/empty when it cannot be
    /// read. Fields are looked up in the nested `update` object first, then
    /// `result`, then the message root.
    pub fn from_message(root: &Value) -> Self {
        let c = Candidates::for_message(root);

        let status = c.string_field(&["status", "matchStatus"]).unwrap_or_default();
        let notes = c.string_field(&["notes"]).unwrap_or_default();
        let completed_flag = c.flag(&["isMatchCompleted", "isCompleted", "matchCompleted"]);
        let is_completion =
            completed_flag || MatchStatus::parse(&status) == Some(MatchStatus::Finished);
        let live_flag = c.flag(&["isMatchStarted", "isLegUpdate", "isLiveUpdate"]);

        let player_names = player_names_from_notes(&notes).or_else(|| {
            let first = c.string_field(&["player1Name", "player1"])?;
            let second = c.string_field(&["player2Name", "player2"])?;
            Some((first, second))
        });

        InboundUpdate {
            numeric_match_id: Some(c.u32_field(&["matchId", "displayId"]))
                .filter(|id| *id != 0)
                .unwrap_or_else(|| c.payload().u32_field(&["id"])),
            durable_match_id: c.string_field(&["matchUuid", "uniqueId", "durableId", "uuid"]),
            class_id: c.u32_field(&["classId", "tournamentClassId"]),
            group_id: Some(c.u32_field(&["groupId"])).filter(|id| *id != 0),
            group_name: c.string_field(&["groupName"]),
            match_type: c
                .string_field(&["matchType", "phase"])
                .and_then(|s| MatchTypeHint::parse(&s)),
            sets1: c.u32_field(&["player1Sets", "sets1"]),
            sets2: c.u32_field(&["player2Sets", "sets2"]),
            legs1: c.u32_field(&["player1Legs", "legs1"]),
            legs2: c.u32_field(&["player2Legs", "legs2"]),
            status,
            notes,
            is_live_progress: live_flag && !is_completion,
            is_completion,
            player_names,
        }
    }

    pub fn parsed_status(&self) -> Option<MatchStatus> {
        MatchStatus::parse(&self.status)
    }

    /// True when the update names a specific phase (match type or group).
    pub fn has_phase_hint(&self) -> bool {
        self.match_type.is_some() || self.group_name.is_some() || self.group_id.is_some()
    }

    pub fn durable_id(&self) -> Option<&str> {
        self.durable_match_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn scores(&self) -> (u32, u32, u32, u32) {
        (self.sets1, self.sets2, self.legs1, self.legs2)
    }
}

/// Pull the two player names out of a structured notes payload.
///
/// Accepts `player1Name`/`player2Name` strings, or `player1`/`player2` given
/// either as strings or as objects with a `name` field. Non-JSON notes yield
/// `None`.
pub fn player_names_from_notes(notes: &str) -> Option<(String, String)> {
    let trimmed = notes.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let obj = value.as_object()?;

    let name_of = |flat: &str, nested: &str| -> Option<String> {
        let v = obj.get(flat).or_else(|| obj.get(nested))?;
        let name = match v {
            Value::String(s) => s.as_str(),
            Value::Object(o) => o.get("name")?.as_str()?,
            _ => return None,
        };
        let name = name.trim();
        (!name.is_empty()).then(|| name.to_string())
    };

    Some((
        name_of("player1Name", "player1")?,
        name_of("player2Name", "player2")?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_full_update_from_nested_object() {
        let msg = json!({
            "type": "tournament-match-updated",
            "tournamentId": "T-1",
            "update": {
                "matchId": "7",
                "matchUuid": "0b7e0f7a-uuid",
                "classId": 2,
                "groupName": "A",
                "matchType": "Group",
                "player1Sets": 3,
                "player2Sets": "1",
                "player1Legs": 9,
                "player2Legs": 4,
                "status": "Finished",
                "notes": "final"
            }
        });
        let u = InboundUpdate::from_message(&msg);
        assert_eq!(u.numeric_match_id, 7);
        assert_eq!(u.durable_id(), Some("0b7e0f7a-uuid"));
        assert_eq!(u.class_id, 2);
        assert_eq!(u.group_name.as_deref(), Some("A"));
        assert_eq!(u.match_type, Some(MatchTypeHint::Group));
        assert_eq!(u.scores(), (3, 1, 9, 4));
        assert_eq!(u.parsed_status(), Some(MatchStatus::Finished));
        assert!(u.is_completion);
        assert!(!u.is_live_progress);
        assert!(u.has_phase_hint());
    }

    #[test]
    fn missing_fields_default_instead_of_failing() {
        let u = InboundUpdate::from_message(&json!({ "type": "tournament-match-updated" }));
        assert_eq!(u.numeric_match_id, 0);
        assert_eq!(u.durable_match_id, None);
        assert_eq!(u.scores(), (0, 0, 0, 0));
        assert_eq!(u.status, "");
        assert!(!u.has_phase_hint());
    }

    #[test]
    fn live_flag_is_cleared_by_completion() {
        let started = json!({ "matchId": 1, "isMatchStarted": true, "status": "InProgress" });
        assert!(InboundUpdate::from_message(&started).is_live_progress);

        let both = json!({ "matchId": 1, "isLegUpdate": true, "isMatchCompleted": "true" });
        let u = InboundUpdate::from_message(&both);
        assert!(u.is_completion);
        assert!(!u.is_live_progress);
    }

    #[test]
    fn result_wrapper_is_searched() {
        let msg = json!({
            "type": "tournament-match-updated",
            "result": { "matchId": 12, "player1Legs": "5", "player2Legs": 3 }
        });
        let u = InboundUpdate::from_message(&msg);
        assert_eq!(u.numeric_match_id, 12);
        assert_eq!((u.legs1, u.legs2), (5, 3));
    }

    #[test]
    fn match_type_aliases() {
        assert_eq!(MatchTypeHint::parse("Knockout-WB"), Some(MatchTypeHint::WinnerBracket));
        assert_eq!(MatchTypeHint::parse("loser_bracket"), Some(MatchTypeHint::LoserBracket));
        assert_eq!(MatchTypeHint::parse("FINALS"), Some(MatchTypeHint::Finals));
        assert_eq!(MatchTypeHint::parse("round robin"), Some(MatchTypeHint::Group));
        assert_eq!(MatchTypeHint::parse("swiss"), None);
    }

    #[test]
    fn player_names_from_structured_notes() {
        let flat = r#"{"player1Name":"Anna","player2Name":"Ben","average":54.2}"#;
        assert_eq!(
            player_names_from_notes(flat),
            Some(("Anna".to_string(), "Ben".to_string()))
        );

        let nested = r#"{"player1":{"name":"Anna"},"player2":{"name":" Ben "}}"#;
        assert_eq!(
            player_names_from_notes(nested),
            Some(("Anna".to_string(), "Ben".to_string()))
        );

        assert_eq!(player_names_from_notes("LIVE leg 3"), None);
        assert_eq!(player_names_from_notes(r#"{"player1Name":"Anna"}"#), None);
    }

    #[test]
    fn player_names_fall_back_to_envelope_fields() {
        let msg = json!({ "matchId": 3, "player1Name": "Cara", "player2Name": "Dan" });
        let u = InboundUpdate::from_message(&msg);
        assert_eq!(u.player_names, Some(("Cara".into(), "Dan".into())));
    }

    #[test]
    fn envelope_id_is_not_a_match_id() {
        let v = json!({
            "type": "tournament-match-updated",
            "id": 501,
            "update": { "player1Sets": 1 }
        });
        assert_eq!(InboundUpdate::from_message(&v).numeric_match_id, 0);

        let v = json!({ "id": 501, "update": { "id": 12, "player1Sets": 1 } });
        assert_eq!(InboundUpdate::from_message(&v).numeric_match_id, 12);

        let v = json!({ "id": 501, "matchId": 8 });
        assert_eq!(InboundUpdate::from_message(&v).numeric_match_id, 8);
    }
}
