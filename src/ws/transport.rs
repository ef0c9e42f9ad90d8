//! [`Transport`] backed by `tokio-tungstenite`.
//!
//! Each [`WsTransport`] owns one socket task. The task performs the handshake, reports
//! frames and the final close through the manager's [`EventSink`], and writes the text
//! frames queued by [`Transport::send`].

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures::{SinkExt as _, StreamExt as _};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderName, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL,
};
use url::Url;

use super::connection::ready_state::{CLOSED, CLOSING, CONNECTING, OPEN};
use super::error::WsError;
use super::traits::{
    CloseEvent, Connector, ErrorEvent, EventSink, Frame, MessageEvent, Notification, OpenEvent,
    Transport,
};
use crate::Result;
use crate::error::Error;

/// Close code reported when the peer's close frame carried no status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Opens [`WsTransport`]s on the ambient tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Transport = WsTransport;

    fn open(
        &self,
        endpoint: &str,
        subprotocols: Option<&[String]>,
        sink: EventSink,
    ) -> Result<WsTransport> {
        let url = Url::parse(endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported scheme {:?}, expected ws or wss",
                url.scheme()
            )));
        }

        let request = build_request(&url, subprotocols)?;
        let runtime = Handle::try_current().map_err(|_e| WsError::NoRuntime)?;

        let shared = Arc::new(Shared::new(url.into()));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(socket_task(
            request,
            Arc::clone(&shared),
            outgoing_rx,
            sink,
        ));

        Ok(WsTransport {
            shared,
            outgoing_tx,
            task,
        })
    }
}

fn build_request(url: &Url, subprotocols: Option<&[String]>) -> Result<Request> {
    let mut request = url.as_str().into_client_request()?;

    if let Some(protocols) = subprotocols
        && !protocols.is_empty()
    {
        let joined = protocols.join(", ");
        let value =
            HeaderValue::from_str(&joined).map_err(|_e| WsError::InvalidSubprotocol(joined))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    Ok(request)
}

/// State the socket task shares with its [`WsTransport`] handle.
#[derive(Debug)]
struct Shared {
    url: String,
    ready_state: AtomicU8,
    buffered: AtomicU64,
    protocol: OnceLock<String>,
    extensions: OnceLock<String>,
}

impl Shared {
    fn new(url: String) -> Self {
        Self {
            url,
            ready_state: AtomicU8::new(CONNECTING),
            buffered: AtomicU64::new(0),
            protocol: OnceLock::new(),
            extensions: OnceLock::new(),
        }
    }

    fn ready_state(&self) -> u8 {
        self.ready_state.load(Ordering::Acquire)
    }

    fn record_handshake(&self, response: &Response) {
        _ = self
            .protocol
            .set(header_value(response, &SEC_WEBSOCKET_PROTOCOL));
        _ = self
            .extensions
            .set(header_value(response, &SEC_WEBSOCKET_EXTENSIONS));
    }
}

fn header_value(response: &Response, name: &HeaderName) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

fn frame_len(text: &str) -> u64 {
    u64::try_from(text.len()).unwrap_or(u64::MAX)
}

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

/// One physical WebSocket connection.
///
/// Dropping the handle aborts the socket task.
#[derive(Debug)]
pub struct WsTransport {
    shared: Arc<Shared>,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    task: JoinHandle<()>,
}

impl Transport for WsTransport {
    fn send(&mut self, text: String) -> Result<()> {
        let ready_state = self.shared.ready_state();
        if ready_state != OPEN {
            return Err(WsError::NotOpen { ready_state }.into());
        }

        let len = frame_len(&text);
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);

        if self.outgoing_tx.send(Outgoing::Text(text)).is_err() {
            self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
            return Err(WsError::ConnectionClosed.into());
        }

        Ok(())
    }

    fn close(&mut self) {
        let closing = self.shared.ready_state.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |state| (state == CONNECTING || state == OPEN).then_some(CLOSING),
        );

        if closing.is_ok() {
            _ = self.outgoing_tx.send(Outgoing::Close);
        }
    }

    fn ready_state(&self) -> u8 {
        self.shared.ready_state()
    }

    fn binary_type(&self) -> &str {
        "arraybuffer"
    }

    fn buffered_amount(&self) -> u64 {
        self.shared.buffered.load(Ordering::Acquire)
    }

    fn extensions(&self) -> &str {
        self.shared.extensions.get().map_or("", String::as_str)
    }

    fn protocol(&self) -> &str {
        self.shared.protocol.get().map_or("", String::as_str)
    }

    fn url(&self) -> &str {
        &self.shared.url
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Handshake, then pump frames both ways until the socket is gone.
async fn socket_task(
    request: Request,
    shared: Arc<Shared>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
    sink: EventSink,
) {
    let (ws_stream, response) = match connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(url = %shared.url, error = %e, "Unable to connect");

            shared.ready_state.store(CLOSED, Ordering::Release);
            sink.emit(Notification::Error(ErrorEvent::new(e.to_string())));
            sink.emit(Notification::Close(CloseEvent::abnormal(e.to_string())));
            return;
        }
    };

    shared.record_handshake(&response);
    let (mut write, mut read) = ws_stream.split();

    // A close requested during the handshake is already queued for the loop below.
    if shared
        .ready_state
        .compare_exchange(CONNECTING, OPEN, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        let protocol = shared.protocol.get().cloned().unwrap_or_default();
        sink.emit(Notification::Open(OpenEvent::with_protocol(protocol)));
    }

    let mut close_event: Option<CloseEvent> = None;
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(text = text.as_str(), "Received WebSocket text message");

                        sink.emit(Notification::Message(MessageEvent::new(Frame::Text(
                            text.as_str().to_owned(),
                        ))));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        sink.emit(Notification::Message(MessageEvent::new(Frame::Binary(
                            bytes.to_vec(),
                        ))));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        shared.ready_state.store(CLOSING, Ordering::Release);
                        close_event = Some(frame.map_or_else(
                            || CloseEvent::new(NO_STATUS_RECEIVED, ""),
                            |frame| CloseEvent::new(u16::from(frame.code), frame.reason.as_str()),
                        ));
                    }
                    Some(Ok(_)) => {
                        // Ping, pong and raw frames are handled by tungstenite.
                    }
                    Some(Err(e)) => {
                        // Once closing, a reset is just the end of the handshake.
                        if close_event.is_none() && shared.ready_state() == OPEN {
                            failure = Some(e.to_string());
                        }
                        break;
                    }
                    None => break,
                }
            }

            Some(outgoing) = outgoing_rx.recv() => {
                let result = match outgoing {
                    Outgoing::Text(text) => {
                        let len = frame_len(&text);
                        let result = write.send(Message::Text(text.into())).await;
                        shared.buffered.fetch_sub(len, Ordering::AcqRel);
                        result
                    }
                    Outgoing::Close => write.send(Message::Close(None)).await,
                };

                if let Err(e) = result {
                    if close_event.is_none() && shared.ready_state() == OPEN {
                        failure = Some(e.to_string());
                    }
                    break;
                }
            }
        }
    }

    shared.ready_state.store(CLOSED, Ordering::Release);
    shared.buffered.store(0, Ordering::Release);

    if let Some(message) = failure {
        #[cfg(feature = "tracing")]
        tracing::warn!(url = %shared.url, error = %message, "WebSocket connection failed");

        sink.emit(Notification::Error(ErrorEvent::new(message.clone())));
        sink.emit(Notification::Close(CloseEvent::abnormal(message)));
    } else {
        sink.emit(Notification::Close(
            close_event.unwrap_or_else(|| CloseEvent::abnormal("connection dropped")),
        ));
    }
}
