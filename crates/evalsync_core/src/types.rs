use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub type EvaluationId = String;

/// A logical push channel. One transport exists per key at most.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChannelKey {
    Evaluation(EvaluationId),
    User(String),
    Broadcast,
}

impl ChannelKey {
    /// Path segments below the websocket base url.
    pub fn segments(&self) -> Vec<&str> {
        match self {
            ChannelKey::Evaluation(id) => vec!["ws", "evaluations", id.as_str()],
            ChannelKey::User(user_id) => vec!["ws", "user", user_id.as_str()],
            ChannelKey::Broadcast => vec!["ws", "broadcast"],
        }
    }

    pub fn evaluation_id(&self) -> Option<&str> {
        match self {
            ChannelKey::Evaluation(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments().join("/"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransportId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    #[default]
    #[serde(alias = "queued")]
    Pending,
    #[serde(alias = "in_progress", alias = "processing")]
    Running,
    #[serde(alias = "complete", alias = "succeeded")]
    Completed,
    #[serde(alias = "error")]
    Failed,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl EvaluationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EvaluationStatus::Completed | EvaluationStatus::Failed | EvaluationStatus::Cancelled
        )
    }
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EvaluationStatus::Pending => "pending",
            EvaluationStatus::Running => "running",
            EvaluationStatus::Completed => "completed",
            EvaluationStatus::Failed => "failed",
            EvaluationStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Push,
    Poll,
}

/// Result reported for one pillar (privacy, toxicity, ...). Scores are
/// computed server-side; the client only carries them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PillarResult {
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub details: serde_json::Map<String, Value>,
}

impl PillarResult {
    pub fn from_score(score: f64) -> Self {
        Self {
            score: Some(score),
            ..Self::default()
        }
    }

    /// Accepts a bare number, an object with `score`/`status`, or anything
    /// else (kept verbatim under `value`).
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Number(n) => Self {
                score: n.as_f64(),
                ..Self::default()
            },
            Value::Object(mut map) => {
                let score = map.remove("score").and_then(|v| v.as_f64());
                let status = map
                    .remove("status")
                    .and_then(|v| v.as_str().map(ToOwned::to_owned));
                Self {
                    score,
                    status,
                    details: map,
                }
            }
            other => {
                let mut details = serde_json::Map::new();
                details.insert("value".to_string(), other);
                Self {
                    details,
                    ..Self::default()
                }
            }
        }
    }
}

/// Field deserializer that reads an explicit `null` as the default value.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub fn pillars_from_values(values: BTreeMap<String, Value>) -> BTreeMap<String, PillarResult> {
    values
        .into_iter()
        .map(|(pillar, value)| (pillar, PillarResult::from_value(value)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectFailed,
    Transport,
    ConnectionLost,
    ReconnectExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Why a status fetch did not produce a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub message: String,
}

impl FetchFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_paths() {
        assert_eq!(
            ChannelKey::Evaluation("e1".into()).to_string(),
            "/ws/evaluations/e1"
        );
        assert_eq!(ChannelKey::User("u7".into()).to_string(), "/ws/user/u7");
        assert_eq!(ChannelKey::Broadcast.to_string(), "/ws/broadcast");
    }

    #[test]
    fn status_aliases() {
        let status: EvaluationStatus = serde_json::from_value(json!("in_progress")).unwrap();
        assert_eq!(status, EvaluationStatus::Running);
        let status: EvaluationStatus = serde_json::from_value(json!("canceled")).unwrap();
        assert!(status.is_terminal());
    }

    #[test]
    fn pillar_from_object_keeps_details() {
        let pillar = PillarResult::from_value(json!({"score": 0.9, "status": "ok", "samples": 12}));
        assert_eq!(pillar.score, Some(0.9));
        assert_eq!(pillar.status.as_deref(), Some("ok"));
        assert_eq!(pillar.details.get("samples"), Some(&json!(12)));
    }
}
