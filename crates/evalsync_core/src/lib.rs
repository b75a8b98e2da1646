//! Evalsync core: pure evaluation-status state machine.
//!
//! Nothing in this crate performs I/O or reads the clock. Transports, HTTP
//! fetches and timers are requested as [`Effect`]s and their outcomes come
//! back as [`Msg`]s, so the whole sync policy can be driven in virtual time.
mod config;
mod connection;
mod effect;
mod message;
mod msg;
mod notifications;
mod record;
mod scheduler;
mod store;
mod timers;
mod types;
mod update;
mod view_model;

pub use config::{
    Backoff, ClientConfig, ConfigError, ConnectionOptions, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_NOTIFICATION_CAPACITY, DEFAULT_POLL_INTERVAL_MS, DEFAULT_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_DELAY_MS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_TERMINAL_GRACE_MS,
};
pub use connection::{
    ChannelEvent, ConnectionManager, ConnectionState, Phase, HEARTBEAT_FRAME,
};
pub use effect::{Effect, StoreEvent};
pub use message::{decode, route, InboundMessage};
pub use msg::Msg;
pub use notifications::{Notification, NotificationInbox};
pub use record::{EvaluationRecord, MergeOutcome, StatusSnapshot, StatusUpdate};
pub use scheduler::{PollEvent, PollScheduler};
pub use store::Store;
pub use timers::{TimerKind, TimerToken};
pub use types::{
    pillars_from_values, ChannelKey, ErrorInfo, ErrorKind, EvaluationId, EvaluationStatus,
    FetchFailure, PillarResult, RequestId, TransportId, UpdateSource,
};
pub use update::update;
pub use view_model::StoreSnapshot;
