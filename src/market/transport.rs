use crate::error::AppError;
use crate::market::types::NORMAL_CLOSURE_CODE;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{ready, Stream, StreamExt};
use reqwest::Client;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Close code reported when the peer sends a close frame without a status.
const NO_STATUS_CLOSE_CODE: u16 = 1005;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Error(String),
    Closed { code: u16, reason: Option<String> },
}

/// A live push connection. Yields events until the link ends.
pub trait Transport: Stream<Item = TransportEvent> + Send + Unpin {
    /// Client-initiated shutdown of the link.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

pub type BoxTransport = Box<dyn Transport>;

pub trait TransportFactory: Send + Sync + 'static {
    fn endpoint(&self) -> &str;
    fn connect(&self) -> BoxFuture<'static, Result<BoxTransport, AppError>>;
}

pub struct WebSocketFactory {
    url: String,
}

impl WebSocketFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl TransportFactory for WebSocketFactory {
    fn endpoint(&self) -> &str {
        &self.url
    }

    fn connect(&self) -> BoxFuture<'static, Result<BoxTransport, AppError>> {
        let url = self.url.clone();
        Box::pin(async move {
            let stream = connect_websocket(&url).await?;
            Ok(Box::new(WebSocketTransport { inner: stream }) as BoxTransport)
        })
    }
}

pub async fn connect_websocket(url: &str) -> Result<WsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

pub struct WebSocketTransport {
    inner: WsStream,
}

fn map_ws_frame(
    frame: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<TransportEvent> {
    match frame {
        Ok(Message::Text(text)) => Some(TransportEvent::Message(text)),
        Ok(Message::Binary(payload)) => match String::from_utf8(payload) {
            Ok(text) => Some(TransportEvent::Message(text)),
            Err(error) => {
                warn!(error = %error, "dropping binary frame that is not utf-8");
                None
            }
        },
        Ok(Message::Close(frame)) => Some(match frame {
            Some(frame) => TransportEvent::Closed {
                code: u16::from(frame.code),
                reason: Some(frame.reason.into_owned()).filter(|reason| !reason.is_empty()),
            },
            None => TransportEvent::Closed {
                code: NO_STATUS_CLOSE_CODE,
                reason: None,
            },
        }),
        Ok(_) => None,
        Err(error) => Some(TransportEvent::Error(error.to_string())),
    }
}

impl Stream for WebSocketTransport {
    type Item = TransportEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let Some(frame) = ready!(self.inner.poll_next_unpin(cx)) else {
                return Poll::Ready(None);
            };
            if let Some(event) = map_ws_frame(frame) {
                return Poll::Ready(Some(event));
            }
        }
    }
}

impl Transport for WebSocketTransport {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        let mut stream = self.inner;
        Box::pin(async move {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "client teardown".into(),
            };
            if let Err(error) = stream.close(Some(frame)).await {
                debug!(error = %error, "websocket close handshake did not complete");
            }
        })
    }
}

/// Server-Sent-Events over a streaming HTTP GET.
pub struct SseFactory {
    client: Client,
    url: String,
}

impl SseFactory {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl TransportFactory for SseFactory {
    fn endpoint(&self) -> &str {
        &self.url
    }

    fn connect(&self) -> BoxFuture<'static, Result<BoxTransport, AppError>> {
        let request = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        Box::pin(async move {
            let response = request.send().await?.error_for_status()?;
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed();
            Ok(Box::new(SseTransport::new(body)) as BoxTransport)
        })
    }
}

pub struct SseTransport {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<TransportEvent>,
    finished: bool,
}

impl SseTransport {
    fn new(body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>) -> Self {
        Self {
            body,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

impl Stream for SseTransport {
    type Item = TransportEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match ready!(self.body.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => {
                    let messages = self.decoder.feed(&chunk);
                    self.pending
                        .extend(messages.into_iter().map(TransportEvent::Message));
                }
                Some(Err(error)) => {
                    self.finished = true;
                    return Poll::Ready(Some(TransportEvent::Error(error.to_string())));
                }
                None => {
                    self.finished = true;
                    let tail = self.decoder.finish();
                    self.pending
                        .extend(tail.into_iter().map(TransportEvent::Message));
                    // A server ending the event stream is an orderly close.
                    self.pending.push_back(TransportEvent::Closed {
                        code: NORMAL_CLOSURE_CODE,
                        reason: None,
                    });
                }
            }
        }
    }
}

impl Transport for SseTransport {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { drop(self) })
    }
}

/// Incremental `text/event-stream` decoder yielding the data payload of each
/// dispatched event. Chunk boundaries may fall anywhere, including inside a
/// multi-byte character.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut dispatched = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(payload) = self.process_line(&line) {
                dispatched.push(payload);
            }
        }

        dispatched
    }

    /// Flushes an event left without its terminating blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            let _ = self.process_line(line.trim_end_matches('\r'));
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data_lines.push(value.to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(payload)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    pub enum Script {
        /// Connection attempt fails before the link opens.
        Refuse(String),
        /// Link opens, yields the events, then ends.
        Session(Vec<TransportEvent>),
        /// Link opens, yields the events, then stays open.
        Hold(Vec<TransportEvent>),
        /// Link opens and relays whatever the test pushes.
        Channel(mpsc::UnboundedReceiver<TransportEvent>),
    }

    #[derive(Clone, Default)]
    pub struct ScriptedFactory {
        scripts: Arc<Mutex<VecDeque<Script>>>,
        connects: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl ScriptedFactory {
        pub fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Arc::new(Mutex::new(scripts.into())),
                ..Default::default()
            }
        }

        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    struct ScriptedTransport {
        events: VecDeque<TransportEvent>,
        relay: Option<mpsc::UnboundedReceiver<TransportEvent>>,
        hold: bool,
        closes: Arc<AtomicUsize>,
    }

    impl Stream for ScriptedTransport {
        type Item = TransportEvent;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            if let Some(event) = self.events.pop_front() {
                return Poll::Ready(Some(event));
            }
            if let Some(relay) = self.relay.as_mut() {
                return relay.poll_recv(cx);
            }
            if self.hold {
                Poll::Pending
            } else {
                Poll::Ready(None)
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    impl TransportFactory for ScriptedFactory {
        fn endpoint(&self) -> &str {
            "scripted://"
        }

        fn connect(&self) -> BoxFuture<'static, Result<BoxTransport, AppError>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or_else(|| Script::Refuse("no script left".to_string()));
            let closes = Arc::clone(&self.closes);

            Box::pin(async move {
                let transport = match script {
                    Script::Refuse(reason) => return Err(AppError::EventStream(reason)),
                    Script::Session(events) => ScriptedTransport {
                        events: events.into(),
                        relay: None,
                        hold: false,
                        closes,
                    },
                    Script::Hold(events) => ScriptedTransport {
                        events: events.into(),
                        relay: None,
                        hold: true,
                        closes,
                    },
                    Script::Channel(relay) => ScriptedTransport {
                        events: VecDeque::new(),
                        relay: Some(relay),
                        hold: true,
                        closes,
                    },
                };
                Ok(Box::new(transport) as BoxTransport)
            })
        }
    }
}
