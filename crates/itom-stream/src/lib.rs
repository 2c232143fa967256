//! Streaming session controller for the chat endpoint.
//!
//! [`StreamController`] owns exactly one in-flight request at a time. A
//! spawned reader task decodes the response body and forwards updates; the
//! controller applies them to its [`StreamingState`] and hands the
//! presentation layer [`StreamOutcome`]s.

pub mod controller;
pub mod error;
pub mod state;
pub mod transport;

pub use controller::{Completion, StreamController, StreamOutcome};
pub use error::{StreamError, StreamErrorCode, TransportError};
pub use state::StreamingState;
pub use transport::{ByteStream, ChatTransport, HttpTransport, StreamRequest, TransportResponse};
