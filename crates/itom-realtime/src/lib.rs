//! Realtime sync channel: one WebSocket per client process, kept alive with
//! heartbeats and re-established with exponential backoff after abnormal
//! closes.

pub mod backoff;
pub mod connector;
pub mod error;
pub mod manager;

pub use backoff::Backoff;
pub use connector::{Connector, Frame, Socket, TungsteniteConnector};
pub use error::{RealtimeError, Result};
pub use manager::{ConnectionState, RealtimeEvent, RealtimeHandle};
