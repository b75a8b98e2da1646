use crate::{EvaluationId, FetchFailure, RequestId, StatusSnapshot, TimerToken, TransportId};

#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    /// A view started caring about an evaluation.
    Track(EvaluationId),
    /// A view stopped caring about an evaluation.
    Untrack(EvaluationId),
    SubscribeUser(String),
    UnsubscribeUser(String),
    SubscribeBroadcast,
    UnsubscribeBroadcast,
    /// Reload the evaluation list over REST.
    RefreshList,
    MarkNotificationsRead,
    /// Drop every interest and release all resources.
    Shutdown,
    TransportOpened {
        transport: TransportId,
    },
    /// The connect attempt itself failed.
    TransportFailed {
        transport: TransportId,
        error: String,
    },
    /// Error on an established transport; a close report may follow.
    TransportError {
        transport: TransportId,
        error: String,
    },
    TransportClosed {
        transport: TransportId,
        reason: Option<String>,
    },
    FrameReceived {
        transport: TransportId,
        text: String,
    },
    TimerFired(TimerToken),
    StatusFetched {
        request: RequestId,
        result: Result<StatusSnapshot, FetchFailure>,
    },
    ListFetched(Result<Vec<StatusSnapshot>, FetchFailure>),
}
