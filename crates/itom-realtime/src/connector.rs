use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::{RealtimeError, Result};

/// Transport-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Close with an optional status code.
    Close(Option<u16>),
    /// Binary, ping and pong frames; never surfaced.
    Other,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = RealtimeError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// An open connection, split into its write and read halves.
pub struct Socket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens realtime sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Socket>;
}

/// tokio-tungstenite connector used outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Socket> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| RealtimeError::Connect(format!("{url}: {e}")))?;
        debug!(url, "realtime socket open");

        let (writer, reader) = ws_stream.split();
        let sink = writer
            .sink_map_err(RealtimeError::from)
            .with(|frame: Frame| future::ready(Ok::<_, RealtimeError>(to_message(frame))));
        let stream = reader.map(|msg| msg.map(from_message).map_err(RealtimeError::from));

        Ok(Socket {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Close(code) => Message::Close(code.map(|code| CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        })),
        Frame::Other => Message::Ping(Default::default()),
    }
}

fn from_message(msg: Message) -> Frame {
    match msg {
        Message::Text(text) => Frame::Text(text.as_str().to_string()),
        Message::Close(frame) => Frame::Close(frame.map(|f| u16::from(f.code))),
        _ => Frame::Other,
    }
}
