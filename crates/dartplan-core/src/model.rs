// Tournament data model: classes, groups, brackets and the matches the Hub updates.
//
// Tournament classes are stored in a flat arena and addressed by integer id.
// Matches never point back at their owner; a `MatchSlot` (collection + index)
// is the only way to address a match from outside its class.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type PlayerId = u32;

// ---------------------------------------------------------------------------
// Players and match status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
}

/// Lifecycle of a single match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchStatus {
    #[default]
    NotStarted,
    InProgress,
    Finished,
    Bye,
}

impl MatchStatus {
    /// Parse a status string as sent by the Hub.
    ///
    /// Matching ignores case, whitespace, `_` and `-`, so "InProgress",
    /// "in_progress" and "in progress" are all accepted. Returns `None` for
    /// empty or unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "notstarted" | "pending" | "scheduled" => Some(MatchStatus::NotStarted),
            "inprogress" | "started" | "live" | "running" => Some(MatchStatus::InProgress),
            "finished" | "completed" | "done" => Some(MatchStatus::Finished),
            "bye" => Some(MatchStatus::Bye),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::NotStarted => "NotStarted",
            MatchStatus::InProgress => "InProgress",
            MatchStatus::Finished => "Finished",
            MatchStatus::Bye => "Bye",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Matches
// ---------------------------------------------------------------------------

/// A round-robin match (group or finals). Knockout matches wrap one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    /// Globally unique identity. Absent on legacy data until repaired.
    #[serde(default)]
    pub durable_id: Option<String>,
    /// Unique only within the owning collection.
    pub display_id: u32,
    pub player1: PlayerId,
    /// `None` for a bye.
    #[serde(default)]
    pub player2: Option<PlayerId>,
    #[serde(default)]
    pub sets1: u32,
    #[serde(default)]
    pub sets2: u32,
    #[serde(default)]
    pub legs1: u32,
    #[serde(default)]
    pub legs2: u32,
    #[serde(default)]
    pub status: MatchStatus,
    /// Free text; carries live-progress markers and statistics payloads.
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub winner: Option<PlayerId>,
}

impl Match {
    pub fn new(display_id: u32, player1: PlayerId, player2: Option<PlayerId>) -> Self {
        Match {
            durable_id: None,
            display_id,
            player1,
            player2,
            sets1: 0,
            sets2: 0,
            legs1: 0,
            legs2: 0,
            status: if player2.is_some() {
                MatchStatus::NotStarted
            } else {
                MatchStatus::Bye
            },
            notes: String::new(),
            started_at: None,
            ended_at: None,
            winner: None,
        }
    }

    pub fn with_durable_id(mut self, id: impl Into<String>) -> Self {
        self.durable_id = Some(id.into());
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status == MatchStatus::Finished
    }

    pub fn scores(&self) -> (u32, u32, u32, u32) {
        (self.sets1, self.sets2, self.legs1, self.legs2)
    }

    /// Decide the winner from the current result: more sets wins, then more
    /// legs. A bye goes to `player1`. Returns `None` on a draw.
    pub fn determine_winner(&self) -> Option<PlayerId> {
        let Some(player2) = self.player2 else {
            return Some(self.player1);
        };
        let by_sets = self.sets1.cmp(&self.sets2);
        let ordering = if by_sets.is_eq() {
            self.legs1.cmp(&self.legs2)
        } else {
            by_sets
        };
        match ordering {
            std::cmp::Ordering::Greater => Some(self.player1),
            std::cmp::Ordering::Less => Some(player2),
            std::cmp::Ordering::Equal => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BracketSide {
    Winner,
    Loser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerSlot {
    First,
    Second,
}

/// Where the winner of a knockout match goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketLink {
    pub side: BracketSide,
    pub display_id: u32,
    pub slot: PlayerSlot,
}

/// A bracket match. Shares the shape of `Match` plus bracket metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnockoutMatch {
    #[serde(flatten)]
    pub game: Match,
    pub round: u32,
    #[serde(default)]
    pub advances_to: Option<BracketLink>,
}

impl KnockoutMatch {
    pub fn new(game: Match, round: u32) -> Self {
        KnockoutMatch {
            game,
            round,
            advances_to: None,
        }
    }

    pub fn advancing_to(mut self, link: BracketLink) -> Self {
        self.advances_to = Some(link);
        self
    }
}

// ---------------------------------------------------------------------------
// Groups, phases, classes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub player_ids: Vec<PlayerId>,
    #[serde(default)]
    pub matches: Vec<Match>,
}

impl Group {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Group {
            id,
            name: name.into(),
            player_ids: Vec::new(),
            matches: Vec::new(),
        }
    }
}

/// The phase a tournament class is currently playing. Exactly one is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    GroupPhase,
    FinalsPhase,
    KnockoutPhase,
}

impl Phase {
    pub fn is_bracket(&self) -> bool {
        matches!(self, Phase::KnockoutPhase)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRules {
    pub game_mode: String,
    pub sets_to_win: u32,
    pub legs_to_win: u32,
    pub double_out: bool,
}

impl Default for GameRules {
    fn default() -> Self {
        GameRules {
            game_mode: "501".into(),
            sets_to_win: 3,
            legs_to_win: 3,
            double_out: true,
        }
    }
}

/// One of the structurally different match collections inside a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// A round-robin group, by index into `TournamentClass::groups`.
    Group(usize),
    Finals,
    WinnerBracket,
    LoserBracket,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collection::Group(idx) => write!(f, "group[{idx}]"),
            Collection::Finals => f.write_str("finals"),
            Collection::WinnerBracket => f.write_str("winner-bracket"),
            Collection::LoserBracket => f.write_str("loser-bracket"),
        }
    }
}

/// Address of a match inside its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchSlot {
    pub collection: Collection,
    pub index: usize,
}

impl MatchSlot {
    pub fn new(collection: Collection, index: usize) -> Self {
        MatchSlot { collection, index }
    }

    pub fn is_knockout(&self) -> bool {
        matches!(
            self.collection,
            Collection::WinnerBracket | Collection::LoserBracket
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentClass {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub rules: GameRules,
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub finals: Option<Group>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub winner_bracket: Vec<KnockoutMatch>,
    #[serde(default)]
    pub loser_bracket: Vec<KnockoutMatch>,
}

impl TournamentClass {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        TournamentClass {
            id,
            name: name.into(),
            rules: GameRules::default(),
            players: Vec::new(),
            groups: Vec::new(),
            finals: None,
            phase: Phase::GroupPhase,
            winner_bracket: Vec::new(),
            loser_bracket: Vec::new(),
        }
    }

    pub fn player_name(&self, id: PlayerId) -> Option<&str> {
        self.players
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.name.as_str())
    }

    /// Every populated collection, in the fixed search order: all groups,
    /// then finals, then winner bracket, then loser bracket.
    pub fn collections(&self) -> Vec<Collection> {
        let mut out: Vec<Collection> = (0..self.groups.len()).map(Collection::Group).collect();
        if self.finals.is_some() {
            out.push(Collection::Finals);
        }
        if !self.winner_bracket.is_empty() {
            out.push(Collection::WinnerBracket);
        }
        if !self.loser_bracket.is_empty() {
            out.push(Collection::LoserBracket);
        }
        out
    }

    /// The matches of one collection, paired with their slots.
    pub fn matches_in(&self, collection: Collection) -> Vec<(MatchSlot, &Match)> {
        let slot = |index| MatchSlot::new(collection, index);
        match collection {
            Collection::Group(g) => self
                .groups
                .get(g)
                .map(|group| group.matches.iter().enumerate().map(|(i, m)| (slot(i), m)).collect())
                .unwrap_or_default(),
            Collection::Finals => self
                .finals
                .as_ref()
                .map(|group| group.matches.iter().enumerate().map(|(i, m)| (slot(i), m)).collect())
                .unwrap_or_default(),
            Collection::WinnerBracket => self
                .winner_bracket
                .iter()
                .enumerate()
                .map(|(i, k)| (slot(i), &k.game))
                .collect(),
            Collection::LoserBracket => self
                .loser_bracket
                .iter()
                .enumerate()
                .map(|(i, k)| (slot(i), &k.game))
                .collect(),
        }
    }

    /// All matches of the class in search order.
    pub fn all_matches(&self) -> Vec<(MatchSlot, &Match)> {
        self.collections()
            .into_iter()
            .flat_map(|c| self.matches_in(c))
            .collect()
    }

    pub fn match_at(&self, slot: MatchSlot) -> Option<&Match> {
        match slot.collection {
            Collection::Group(g) => self.groups.get(g)?.matches.get(slot.index),
            Collection::Finals => self.finals.as_ref()?.matches.get(slot.index),
            Collection::WinnerBracket => self.winner_bracket.get(slot.index).map(|k| &k.game),
            Collection::LoserBracket => self.loser_bracket.get(slot.index).map(|k| &k.game),
        }
    }

    pub fn match_at_mut(&mut self, slot: MatchSlot) -> Option<&mut Match> {
        match slot.collection {
            Collection::Group(g) => self.groups.get_mut(g)?.matches.get_mut(slot.index),
            Collection::Finals => self.finals.as_mut()?.matches.get_mut(slot.index),
            Collection::WinnerBracket => {
                self.winner_bracket.get_mut(slot.index).map(|k| &mut k.game)
            }
            Collection::LoserBracket => self.loser_bracket.get_mut(slot.index).map(|k| &mut k.game),
        }
    }

    pub fn knockout_at(&self, slot: MatchSlot) -> Option<&KnockoutMatch> {
        match slot.collection {
            Collection::WinnerBracket => self.winner_bracket.get(slot.index),
            Collection::LoserBracket => self.loser_bracket.get(slot.index),
            _ => None,
        }
    }

    pub fn bracket_mut(&mut self, side: BracketSide) -> &mut Vec<KnockoutMatch> {
        match side {
            BracketSide::Winner => &mut self.winner_bracket,
            BracketSide::Loser => &mut self.loser_bracket,
        }
    }

    /// Name of the group owning `slot`, if it is a group match.
    pub fn group_name(&self, slot: MatchSlot) -> Option<&str> {
        match slot.collection {
            Collection::Group(g) => self.groups.get(g).map(|group| group.name.as_str()),
            Collection::Finals => self.finals.as_ref().map(|group| group.name.as_str()),
            _ => None,
        }
    }

    pub fn active_match_count(&self) -> usize {
        self.all_matches()
            .iter()
            .filter(|(_, m)| m.status == MatchStatus::InProgress)
            .count()
    }
}

/// The whole tournament as persisted and resynced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tournament {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub classes: Vec<TournamentClass>,
}

impl Tournament {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Tournament {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            classes: Vec::new(),
        }
    }

    pub fn class(&self, class_id: u32) -> Option<&TournamentClass> {
        self.classes.iter().find(|c| c.id == class_id)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
