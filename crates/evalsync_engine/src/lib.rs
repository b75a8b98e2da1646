//! Evalsync engine: async runtime that executes the core's effects.
mod engine;
mod fetch;
mod transport;
mod types;

pub use engine::{ClientHandle, TrackingGuard};
pub use fetch::{FetchSettings, ReqwestStatusClient, StatusClient};
pub use transport::{Connector, Transport, WsConnector};
pub use types::{EngineError, FailureKind, FetchError, TransportError};
