use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::InboundMessage;
use crate::types::{null_as_default, pillars_from_values};
use crate::{EvaluationId, EvaluationStatus, PillarResult, UpdateSource};

/// Body of `GET /evaluations/{id}`; list entries use the same shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default, alias = "evaluation_id")]
    pub id: EvaluationId,
    pub status: EvaluationStatus,
    #[serde(default, alias = "progress", alias = "percent_complete")]
    pub progress_percent: Option<f64>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub completed_steps: Option<u32>,
    #[serde(default)]
    pub total_steps: Option<u32>,
    #[serde(
        default,
        alias = "pillar_scores",
        alias = "partial_pillar_results",
        deserialize_with = "null_as_default"
    )]
    pub pillar_results: BTreeMap<String, Value>,
    #[serde(default)]
    pub overall_score: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default, alias = "error")]
    pub error_message: Option<String>,
    #[serde(default, alias = "timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A partial record as delivered by either channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusUpdate {
    pub status: Option<EvaluationStatus>,
    pub progress_percent: Option<f64>,
    pub current_step: Option<String>,
    pub completed_steps: Option<u32>,
    pub total_steps: Option<u32>,
    pub pillar_results: BTreeMap<String, PillarResult>,
    pub overall_score: Option<f64>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    /// Server-side time of the data, when the server sent one.
    pub observed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn from_snapshot(snapshot: StatusSnapshot) -> Self {
        Self {
            status: Some(snapshot.status),
            progress_percent: snapshot.progress_percent.map(|p| p.clamp(0.0, 100.0)),
            current_step: snapshot.current_step,
            completed_steps: snapshot.completed_steps,
            total_steps: snapshot.total_steps,
            pillar_results: pillars_from_values(snapshot.pillar_results),
            overall_score: snapshot.overall_score,
            duration_ms: snapshot.duration_ms,
            error_message: snapshot.error_message,
            observed_at: snapshot.updated_at,
        }
    }

    /// Evaluation-carrying push messages; `None` for everything else.
    pub fn from_message(message: &InboundMessage) -> Option<(EvaluationId, Self)> {
        match message {
            InboundMessage::Progress {
                evaluation_id,
                percent_complete,
                current_step,
                completed_steps,
                total_steps,
                partial_pillar_results,
                timestamp,
            } => Some((
                evaluation_id.clone(),
                Self {
                    status: Some(EvaluationStatus::Running),
                    progress_percent: Some(*percent_complete),
                    current_step: current_step.clone(),
                    completed_steps: *completed_steps,
                    total_steps: *total_steps,
                    pillar_results: partial_pillar_results.clone(),
                    observed_at: *timestamp,
                    ..Self::default()
                },
            )),
            InboundMessage::Complete {
                evaluation_id,
                status,
                overall_score,
                pillar_scores,
                duration_ms,
                error,
                timestamp,
            } => Some((
                evaluation_id.clone(),
                Self {
                    status: Some(*status),
                    overall_score: *overall_score,
                    pillar_results: pillar_scores.clone(),
                    duration_ms: *duration_ms,
                    error_message: error.clone(),
                    observed_at: *timestamp,
                    ..Self::default()
                },
            )),
            InboundMessage::Failed {
                evaluation_id,
                error,
                timestamp,
            } => Some((
                evaluation_id.clone(),
                Self {
                    status: Some(EvaluationStatus::Failed),
                    error_message: Some(error.clone()),
                    observed_at: *timestamp,
                    ..Self::default()
                },
            )),
            InboundMessage::Connected
            | InboundMessage::Notification { .. }
            | InboundMessage::Broadcast { .. }
            | InboundMessage::Heartbeat => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(EvaluationStatus::is_terminal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Visible fields changed.
    Updated,
    /// The record just became terminal.
    Terminated,
    /// Nothing visible changed (older data, or identical values).
    Unchanged,
    /// The record was already terminal; the update was discarded.
    IgnoredTerminal,
}

/// Canonical client-side state of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: EvaluationId,
    pub status: EvaluationStatus,
    pub progress_percent: f64,
    pub current_step: Option<String>,
    pub completed_steps: Option<u32>,
    pub total_steps: Option<u32>,
    pub pillar_results: BTreeMap<String, PillarResult>,
    pub overall_score: Option<f64>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub last_update_source: Option<UpdateSource>,
    /// Client arrival time of the data currently shown.
    pub last_update_at: Option<DateTime<Utc>>,
    /// Newest server timestamp merged so far. Only compared with other
    /// server timestamps.
    #[serde(default)]
    pub last_server_at: Option<DateTime<Utc>>,
    /// Both push and poll are failing; the data may be out of date.
    pub stale: bool,
}

impl EvaluationRecord {
    pub fn new(id: impl Into<EvaluationId>) -> Self {
        Self {
            id: id.into(),
            status: EvaluationStatus::Pending,
            progress_percent: 0.0,
            current_step: None,
            completed_steps: None,
            total_steps: None,
            pillar_results: BTreeMap::new(),
            overall_score: None,
            duration_ms: None,
            error_message: None,
            last_update_source: None,
            last_update_at: None,
            last_server_at: None,
            stale: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merge rule:
    /// 1. a terminal record ignores everything,
    /// 2. a terminal update wins regardless of its timestamp,
    /// 3. otherwise scalar fields follow the most recently timestamped data
    ///    and pillar keys are unioned (never dropped).
    ///
    /// Server timestamps are only compared with server timestamps. When
    /// either side lacks one, arrival order decides.
    pub fn apply(
        &mut self,
        update: &StatusUpdate,
        source: UpdateSource,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        if self.is_terminal() {
            return MergeOutcome::IgnoredTerminal;
        }

        if let Some(status) = update.status.filter(|status| status.is_terminal()) {
            self.status = status;
            if status == EvaluationStatus::Completed {
                self.progress_percent = 100.0;
            } else if let Some(percent) = update.progress_percent {
                self.progress_percent = percent;
            }
            merge_opt(&mut self.current_step, &update.current_step);
            merge_opt(&mut self.completed_steps, &update.completed_steps);
            merge_opt(&mut self.total_steps, &update.total_steps);
            merge_opt(&mut self.overall_score, &update.overall_score);
            merge_opt(&mut self.duration_ms, &update.duration_ms);
            merge_opt(&mut self.error_message, &update.error_message);
            for (pillar, result) in &update.pillar_results {
                self.pillar_results.insert(pillar.clone(), result.clone());
            }
            self.last_update_source = Some(source);
            self.last_update_at = Some(self.last_update_at.map_or(now, |last| last.max(now)));
            self.last_server_at = self.last_server_at.max(update.observed_at);
            return MergeOutcome::Terminated;
        }

        let before = self.clone();
        let newer = match (update.observed_at, self.last_server_at) {
            (Some(incoming), Some(last)) => incoming >= last,
            _ => self.last_update_at.is_none_or(|last| now >= last),
        };
        if newer {
            set_if_some(&mut self.status, &update.status);
            set_if_some(&mut self.progress_percent, &update.progress_percent);
            merge_opt(&mut self.current_step, &update.current_step);
            merge_opt(&mut self.completed_steps, &update.completed_steps);
            merge_opt(&mut self.total_steps, &update.total_steps);
            merge_opt(&mut self.overall_score, &update.overall_score);
            merge_opt(&mut self.duration_ms, &update.duration_ms);
            merge_opt(&mut self.error_message, &update.error_message);
        }
        for (pillar, result) in &update.pillar_results {
            if newer || !self.pillar_results.contains_key(pillar) {
                self.pillar_results.insert(pillar.clone(), result.clone());
            }
        }

        let changed = !same_visible_state(&before, self);
        if newer {
            self.last_update_source = Some(source);
            self.last_update_at = Some(now);
            if update.observed_at.is_some() {
                self.last_server_at = update.observed_at;
            }
        }
        if changed {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Unchanged
        }
    }
}

fn set_if_some<T: Clone>(target: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}

fn merge_opt<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        target.clone_from(value);
    }
}

fn same_visible_state(a: &EvaluationRecord, b: &EvaluationRecord) -> bool {
    a.status == b.status
        && a.progress_percent == b.progress_percent
        && a.current_step == b.current_step
        && a.completed_steps == b.completed_steps
        && a.total_steps == b.total_steps
        && a.pillar_results == b.pillar_results
        && a.overall_score == b.overall_score
        && a.duration_ms == b.duration_ms
        && a.error_message == b.error_message
        && a.stale == b.stale
}
