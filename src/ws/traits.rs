//! Core traits and event types shared by the connection manager and its transports.

use tokio::sync::mpsc;

use crate::Result;

/// Opens physical connections on behalf of a [`ConnectionManager`](super::ConnectionManager).
///
/// A connector is the environment the manager lives in: it is asked for a brand new
/// [`Transport`] on every connect, reconnect and restart.
///
/// # Example
///
/// ```ignore
/// impl Connector for MyConnector {
///     type Transport = MyTransport;
///
///     fn open(&self, endpoint: &str, subprotocols: Option<&[String]>, sink: EventSink) -> Result<MyTransport> {
///         let transport = MyTransport::dial(endpoint, subprotocols)?;
///         transport.on_ready(move || { sink.emit(Notification::Open(OpenEvent::new())); });
///         Ok(transport)
///     }
/// }
/// ```
pub trait Connector: Send + 'static {
    type Transport: Transport;

    /// Start opening a connection to `endpoint`.
    ///
    /// Returning an error means the transport could not even be constructed. Everything
    /// that goes wrong later must be reported through `sink` as an error notification
    /// followed by a close notification.
    fn open(
        &self,
        endpoint: &str,
        subprotocols: Option<&[String]>,
        sink: EventSink,
    ) -> Result<Self::Transport>;
}

/// A single physical connection.
///
/// Property getters report live values. Ready state codes follow the usual
/// WebSocket numbering, see [`ready_state`](super::connection::ready_state).
pub trait Transport: Send + 'static {
    /// Hand a text frame to the connection.
    ///
    /// Must fail when the connection is not open.
    fn send(&mut self, text: String) -> Result<()>;

    /// Ask the connection to close. Completion is reported by a close notification.
    fn close(&mut self);

    fn ready_state(&self) -> u8;

    fn binary_type(&self) -> &str;

    /// Number of bytes accepted by [`Transport::send`] but not yet written out.
    fn buffered_amount(&self) -> u64;

    fn extensions(&self) -> &str;

    fn protocol(&self) -> &str;

    fn url(&self) -> &str;
}

/// Raw payload of a received frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenEvent {
    /// Subprotocol selected by the server, empty if none
    pub protocol: String,
}

impl OpenEvent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_protocol<S: Into<String>>(protocol: S) -> Self {
        Self {
            protocol: protocol.into(),
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub data: Frame,
}

impl MessageEvent {
    #[must_use]
    pub fn new(data: Frame) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::new(Frame::Text(text.into()))
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close code, 1006 when the connection dropped without a close frame
    pub code: u16,
    pub reason: String,
    /// Whether a close handshake completed
    pub was_clean: bool,
}

impl CloseEvent {
    /// Close code used when no close frame was received.
    pub const ABNORMAL: u16 = 1006;

    #[must_use]
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean: code != Self::ABNORMAL,
        }
    }

    #[must_use]
    pub fn abnormal<S: Into<String>>(reason: S) -> Self {
        Self::new(Self::ABNORMAL, reason)
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub message: String,
}

impl ErrorEvent {
    #[must_use]
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Notifications a transport delivers to its manager.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Open(OpenEvent),
    Message(MessageEvent),
    Close(CloseEvent),
    Error(ErrorEvent),
}

impl Notification {
    #[must_use]
    pub const fn kind(&self) -> NotificationKind {
        match self {
            Self::Open(_) => NotificationKind::Open,
            Self::Message(_) => NotificationKind::Message,
            Self::Close(_) => NotificationKind::Close,
            Self::Error(_) => NotificationKind::Error,
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Open,
    Message,
    Close,
    Error,
}

#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) generation: u64,
    pub(crate) notification: Notification,
}

/// Channel end through which one transport reports to its manager.
///
/// Every sink is bound to the transport it was issued for. Once the manager has moved
/// on to a newer transport, whatever an older sink emits is ignored.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { generation, tx }
    }

    /// Deliver a notification. Returns `false` once the manager is gone.
    pub fn emit(&self, notification: Notification) -> bool {
        self.tx
            .send(Envelope {
                generation: self.generation,
                notification,
            })
            .is_ok()
    }
}
