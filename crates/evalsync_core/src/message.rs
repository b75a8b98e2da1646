//! Message router: turns raw inbound frames into typed messages.
//!
//! Decoding is pure and total. Malformed frames and unknown `type` tags are
//! logged and dropped; bare non-JSON bodies are liveness acks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use evalsync_logging::{sync_debug, sync_trace};
use serde::Deserialize;
use serde_json::Value;

use crate::types::{null_as_default, pillars_from_values};
use crate::{ChannelKey, EvaluationId, EvaluationStatus, PillarResult};

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Connected,
    Progress {
        evaluation_id: EvaluationId,
        percent_complete: f64,
        current_step: Option<String>,
        completed_steps: Option<u32>,
        total_steps: Option<u32>,
        partial_pillar_results: BTreeMap<String, PillarResult>,
        timestamp: Option<DateTime<Utc>>,
    },
    Complete {
        evaluation_id: EvaluationId,
        /// Completed unless the server says failed or cancelled.
        status: EvaluationStatus,
        overall_score: Option<f64>,
        pillar_scores: BTreeMap<String, PillarResult>,
        duration_ms: Option<u64>,
        error: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    /// `{"type": "error"}` on an evaluation channel.
    Failed {
        evaluation_id: EvaluationId,
        error: String,
        timestamp: Option<DateTime<Utc>>,
    },
    Notification {
        user_id: Option<String>,
        kind: String,
        title: String,
        body: String,
        payload: Value,
    },
    Broadcast {
        payload: Value,
    },
    Heartbeat,
}

#[derive(Deserialize)]
struct ProgressFrame {
    evaluation_id: EvaluationId,
    #[serde(
        default,
        alias = "progress",
        alias = "percent",
        deserialize_with = "null_as_default"
    )]
    percent_complete: f64,
    #[serde(default)]
    current_step: Option<String>,
    #[serde(default)]
    completed_steps: Option<u32>,
    #[serde(default)]
    total_steps: Option<u32>,
    #[serde(default, alias = "pillar_results", deserialize_with = "null_as_default")]
    partial_pillar_results: BTreeMap<String, Value>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct CompleteFrame {
    evaluation_id: EvaluationId,
    #[serde(default)]
    status: Option<EvaluationStatus>,
    #[serde(default, alias = "score")]
    overall_score: Option<f64>,
    #[serde(default, alias = "pillar_results", deserialize_with = "null_as_default")]
    pillar_scores: BTreeMap<String, Value>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ErrorFrame {
    evaluation_id: EvaluationId,
    #[serde(default, alias = "message")]
    error: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct NotificationFrame {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default, alias = "notification_type")]
    kind: String,
    #[serde(default)]
    title: String,
    #[serde(default, alias = "message")]
    body: String,
    #[serde(default, alias = "data")]
    payload: Value,
}

enum Frame {
    Json(Value),
    /// Non-JSON text such as `pong`.
    Control,
    Malformed,
    Empty,
}

fn classify(raw: &str) -> Frame {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Frame::Empty;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Frame::Json(value),
        Err(_) if trimmed.starts_with('{') || trimmed.starts_with('[') => Frame::Malformed,
        Err(_) => Frame::Control,
    }
}

/// Decode one frame without channel context.
pub fn decode(raw: &str) -> Option<InboundMessage> {
    match classify(raw) {
        Frame::Json(value) => decode_value(value),
        Frame::Control => Some(InboundMessage::Heartbeat),
        Frame::Malformed => {
            sync_debug!("dropping malformed frame ({} bytes)", raw.len());
            None
        }
        Frame::Empty => None,
    }
}

/// Decode one frame received on `channel`.
///
/// Evaluation frames that omit `evaluation_id` inherit the channel's id;
/// frames naming another evaluation are dropped. On the broadcast channel any
/// object that is not a control message becomes a `Broadcast` payload.
pub fn route(channel: &ChannelKey, raw: &str) -> Option<InboundMessage> {
    let value = match classify(raw) {
        Frame::Json(value) => value,
        Frame::Control => return Some(InboundMessage::Heartbeat),
        Frame::Malformed => {
            sync_debug!("dropping malformed frame on {} ({} bytes)", channel, raw.len());
            return None;
        }
        Frame::Empty => return None,
    };

    match channel {
        ChannelKey::Evaluation(id) => {
            let mut value = value;
            if let Value::Object(map) = &mut value {
                let named = map
                    .entry("evaluation_id")
                    .or_insert_with(|| Value::String(id.clone()));
                if named.is_null() {
                    *named = Value::String(id.clone());
                }
                if named.as_str() != Some(id.as_str()) {
                    sync_debug!("dropping frame for {} received on {}", named, channel);
                    return None;
                }
            }
            decode_value(value)
        }
        ChannelKey::Broadcast => match type_tag(&value) {
            Some("heartbeat" | "pong" | "ping" | "connected" | "broadcast") => decode_value(value),
            _ if value.is_object() => Some(InboundMessage::Broadcast { payload: value }),
            _ => decode_value(value),
        },
        ChannelKey::User(_) => decode_value(value),
    }
}

fn type_tag(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

fn decode_value(value: Value) -> Option<InboundMessage> {
    let tag = match &value {
        Value::Object(_) => match type_tag(&value) {
            Some(tag) => tag.to_ascii_lowercase(),
            None => {
                sync_debug!("dropping frame without type tag");
                return None;
            }
        },
        // A JSON string is still a bare liveness ack.
        Value::String(_) => return Some(InboundMessage::Heartbeat),
        _ => {
            sync_debug!("dropping non-object frame");
            return None;
        }
    };

    let decoded = match tag.as_str() {
        "connected" => Some(InboundMessage::Connected),
        "heartbeat" | "pong" | "ping" => Some(InboundMessage::Heartbeat),
        "progress" => parse::<ProgressFrame>(&tag, value).map(|frame| InboundMessage::Progress {
            evaluation_id: frame.evaluation_id,
            percent_complete: clamp_percent(frame.percent_complete),
            current_step: frame.current_step,
            completed_steps: frame.completed_steps,
            total_steps: frame.total_steps,
            partial_pillar_results: pillars_from_values(frame.partial_pillar_results),
            timestamp: frame.timestamp,
        }),
        "complete" | "completed" => {
            parse::<CompleteFrame>(&tag, value).map(|frame| InboundMessage::Complete {
                evaluation_id: frame.evaluation_id,
                status: frame
                    .status
                    .filter(|status| status.is_terminal())
                    .unwrap_or(EvaluationStatus::Completed),
                overall_score: frame.overall_score,
                pillar_scores: pillars_from_values(frame.pillar_scores),
                duration_ms: frame.duration_ms,
                error: frame.error,
                timestamp: frame.timestamp,
            })
        }
        "error" | "failed" => parse::<ErrorFrame>(&tag, value).map(|frame| InboundMessage::Failed {
            evaluation_id: frame.evaluation_id,
            error: frame.error.unwrap_or_else(|| "evaluation failed".to_string()),
            timestamp: frame.timestamp,
        }),
        "notification" => {
            parse::<NotificationFrame>(&tag, value).map(|frame| InboundMessage::Notification {
                user_id: frame.user_id,
                kind: frame.kind,
                title: frame.title,
                body: frame.body,
                payload: frame.payload,
            })
        }
        "broadcast" => {
            let payload = match value {
                Value::Object(mut map) => map.remove("payload").unwrap_or(Value::Object(map)),
                other => other,
            };
            Some(InboundMessage::Broadcast { payload })
        }
        unknown => {
            sync_debug!("dropping frame with unknown type {:?}", unknown);
            None
        }
    };

    if let Some(message) = &decoded {
        sync_trace!("decoded {:?}", message);
    }
    decoded
}

fn parse<T: serde::de::DeserializeOwned>(tag: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(frame) => Some(frame),
        Err(err) => {
            sync_debug!("dropping {} frame: {}", tag, err);
            None
        }
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}
