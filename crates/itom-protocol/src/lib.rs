//! Wire formats shared by the chat client: the SSE-like chat stream, the
//! request bodies that open it, and the realtime sync envelope.

pub mod events;
pub mod realtime;
pub mod request;
pub mod sse;

pub use events::{decode_list, ClarificationRequest, StreamEnd, StreamEvent, StreamStart};
pub use realtime::{ChatPayload, Envelope, EnvelopeType};
pub use request::{ClarifyRequest, StreamChatRequest};
pub use sse::{EventStreamDecoder, RawEvent};
