use std::time::Duration;

use serde_json::Value;

use crate::{
    ChannelKey, EvaluationId, EvaluationRecord, Notification, Phase, RequestId, TimerToken,
    TransportId,
};

/// Side effects requested by the core. The runtime executes them and reports
/// back through [`crate::Msg`].
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenTransport {
        channel: ChannelKey,
        transport: TransportId,
        url: String,
    },
    CloseTransport {
        transport: TransportId,
    },
    SendFrame {
        transport: TransportId,
        text: String,
    },
    ScheduleTimer {
        token: TimerToken,
        delay: Duration,
        repeat: bool,
    },
    CancelTimer {
        token: TimerToken,
    },
    FetchStatus {
        request: RequestId,
        evaluation_id: EvaluationId,
    },
    CancelFetch {
        request: RequestId,
    },
    FetchList,
    Publish(StoreEvent),
}

/// Change notifications fanned out to every UI consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    RecordChanged(EvaluationRecord),
    RecordStale {
        evaluation_id: EvaluationId,
        stale: bool,
    },
    /// The id left the tracked set; its channel and poll slot are released.
    TrackingReleased(EvaluationId),
    Notification(Notification),
    Broadcast(Value),
    ChannelPhaseChanged {
        channel: ChannelKey,
        phase: Phase,
    },
}
