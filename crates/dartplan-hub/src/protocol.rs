// Hub streaming protocol: inbound envelopes and outbound messages.
//
// Every frame is a JSON object discriminated by its `type` string. Inbound
// payloads are read defensively (see dartplan_core::fields); outbound
// messages are plain serde structs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use dartplan_core::fields::{value_as_bool, Candidates};
use dartplan_core::update::InboundUpdate;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {source}")]
    InvalidJson { source: serde_json::Error },

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("envelope has no `type` field")]
    MissingType,

    #[error("unknown message type `{kind}`")]
    UnknownType { kind: String },

    #[error("failed to encode outbound message: {source}")]
    Encode { source: serde_json::Error },
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
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
    MatchUpdate {
        tournament_id: Option<String>,
        update: InboundUpdate,
    },
    HeartbeatAck,
    Error {
        message: String,
    },
}

impl InboundMessage {
    /// Parse one text frame. Unknown kinds and malformed envelopes are
    /// errors; missing fields inside a known kind are not.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let root: Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidJson { source: e })?;
        if !root.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        let kind = root
            .get("type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(ProtocolError::MissingType)?;

        let c = Candidates::for_message(&root);
        let tournament_id = c.string_field(&["tournamentId", "tournament_id"]);

        let msg = match kind {
            "welcome" => InboundMessage::Welcome {
                client_id: c.string_field(&["clientId", "client_id"]),
            },
            "subscription-confirmed" => InboundMessage::SubscriptionConfirmed { tournament_id },
            "planner-registration-confirmed" => InboundMessage::PlannerRegistrationConfirmed {
                tournament_id,
                success: c.get(&["success"]).map_or(true, value_as_bool),
            },
            "tournament-match-updated" => InboundMessage::MatchUpdate {
                tournament_id,
                update: InboundUpdate::from_message(&root),
            },
            "heartbeat-ack" => InboundMessage::HeartbeatAck,
            "error" => InboundMessage::Error {
                message: c
                    .string_field(&["message", "error"])
                    .unwrap_or_else(|| "unspecified hub error".to_string()),
            },
            other => {
                return Err(ProtocolError::UnknownType {
                    kind: other.to_string(),
                })
            }
        };
        Ok(msg)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Welcome { .. } => "welcome",
            InboundMessage::SubscriptionConfirmed { .. } => "subscription-confirmed",
            InboundMessage::PlannerRegistrationConfirmed { .. } => "planner-registration-confirmed",
            InboundMessage::MatchUpdate { .. } => "tournament-match-updated",
            InboundMessage::HeartbeatAck => "heartbeat-ack",
            InboundMessage::Error { .. } => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutboundMessage {
    SubscribeTournament {
        tournament_id: String,
    },
    RegisterPlanner {
        tournament_id: String,
        client_name: String,
        client_version: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tournament_id: Option<String>,
    },
    MatchUpdateAcknowledged {
        tournament_id: String,
        match_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        match_uuid: Option<String>,
        timestamp: DateTime<Utc>,
        changed: bool,
    },
    MatchUpdateError {
        tournament_id: String,
        match_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        match_uuid: Option<String>,
        timestamp: DateTime<Utc>,
        error: String,
    },
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode { source: e })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::SubscribeTournament { .. } => "subscribe-tournament",
            OutboundMessage::RegisterPlanner { .. } => "register-planner",
            OutboundMessage::Heartbeat { .. } => "heartbeat",
            OutboundMessage::MatchUpdateAcknowledged { .. } => "match-update-acknowledged",
            OutboundMessage::MatchUpdateError { .. } => "match-update-error",
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
