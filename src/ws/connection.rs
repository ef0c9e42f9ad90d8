#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::time::Duration;

use phf::phf_map;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

use super::config::{Config, ReconnectPolicy};
use super::error::WsError;
use super::traits::{
    CloseEvent, Connector, Envelope, ErrorEvent, EventSink, Frame, MessageEvent, Notification,
    NotificationKind, OpenEvent, Transport,
};
use crate::Result;

/// Ready state codes reported by [`Transport::ready_state`].
pub mod ready_state {
    pub const CONNECTING: u8 = 0;
    pub const OPEN: u8 = 1;
    pub const CLOSING: u8 = 2;
    pub const CLOSED: u8 = 3;
}

/// Ready state code to name, as exposed by [`ConnectionManager::current_state`].
pub static READY_STATES: phf::Map<u8, &'static str> = phf_map! {
    0_u8 => "CONNECTING",
    1_u8 => "OPEN",
    2_u8 => "CLOSING",
    3_u8 => "CLOSED",
};

/// Binary representation mode to name, as exposed by [`ConnectionManager::binary_type`].
pub static BINARY_TYPES: phf::Map<&'static str, &'static str> = phf_map! {
    "blob" => "blob",
    "arraybuffer" => "arraybuffer",
};

/// An incoming message as handed to the message handler.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<M> {
    /// The frame was text and decoded as `M`
    Decoded(M),
    /// Decoding was disabled, not applicable, or failed
    Raw(Frame),
}

impl<M> Payload<M> {
    #[must_use]
    pub fn decoded(self) -> Option<M> {
        match self {
            Self::Decoded(message) => Some(message),
            Self::Raw(_) => None,
        }
    }
}

/// Where the manager stands in its connect / reconnect cycle.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// `connect` was never called
    Idle,
    /// A transport is held and its close notification has not arrived yet
    Active,
    /// Waiting out the retry delay before the next attempt
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
    /// Closed on request
    Closed,
    /// Dropped unexpectedly while automatic reconnection is disabled
    Disconnected,
    /// Dropped unexpectedly after the retry budget was spent
    GaveUp {
        /// Number of attempts made since the last successful open
        attempts: u32,
    },
}

/// What a close notification leads to, evaluated once per notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseOutcome {
    Restart,
    Reconnect,
    Terminal,
}

type OpenHandler<C, M> = Box<dyn FnMut(&mut ConnectionManager<C, M>, &OpenEvent) + Send>;
type MessageHandler<C, M> =
    Box<dyn FnMut(&mut ConnectionManager<C, M>, Payload<M>, &MessageEvent) + Send>;
type CloseHandler<C, M> = Box<dyn FnMut(&mut ConnectionManager<C, M>, &CloseEvent) + Send>;
type ErrorHandler<C, M> = Box<dyn FnMut(&mut ConnectionManager<C, M>, &ErrorEvent) + Send>;

/// Holds at most one handler. A handler is taken out while it runs so it can be
/// handed `&mut ConnectionManager`, and goes back in unless it was replaced meanwhile.
struct Slot<F> {
    handler: Option<F>,
    replaced: bool,
}

impl<F> Slot<F> {
    const fn empty() -> Self {
        Self {
            handler: None,
            replaced: false,
        }
    }

    fn set(&mut self, handler: Option<F>) {
        self.handler = handler;
        self.replaced = true;
    }

    fn take(&mut self) -> Option<F> {
        self.replaced = false;
        self.handler.take()
    }

    fn restore(&mut self, handler: F) {
        if !self.replaced {
            self.handler = Some(handler);
        }
    }
}

struct Handlers<C: Connector, M> {
    open: Slot<OpenHandler<C, M>>,
    message: Slot<MessageHandler<C, M>>,
    close: Slot<CloseHandler<C, M>>,
    error: Slot<ErrorHandler<C, M>>,
}

impl<C: Connector, M> Handlers<C, M> {
    const fn new() -> Self {
        Self {
            open: Slot::empty(),
            message: Slot::empty(),
            close: Slot::empty(),
            error: Slot::empty(),
        }
    }
}

/// Keeps one logical WebSocket connection alive over a sequence of physical ones.
///
/// The manager owns at most one [`Transport`] at a time. Each transport reports back
/// through its own [`EventSink`]; [`turn`](Self::turn) and [`run`](Self::run) pull
/// those notifications (and due reconnects) and apply the lifecycle rules:
///
/// - a close that was requested with [`close`](Self::close) is terminal
/// - a close that follows [`restart`](Self::restart) opens a fresh transport right away
/// - any other close is retried after a fixed delay, up to `max_retries` times
///
/// Handlers receive the manager itself, so they may send, close or restart from inside
/// a callback.
///
/// # Type Parameters
///
/// - `C`: the [`Connector`] asked for every new transport
/// - `M`: what incoming text frames are decoded into, [`Value`] by default
///
/// # Example
///
/// ```ignore
/// let mut manager = ConnectionManager::new("wss://example.com", None, Config::default(), WsConnector);
/// manager.on_open(|manager, _| {
///     manager.send(&json!({ "type": "hello" }));
/// });
/// manager.on_message(|_, payload, _| println!("{payload:?}"));
/// manager.connect()?;
/// manager.run().await?;
/// ```
pub struct ConnectionManager<C: Connector, M = Value> {
    endpoint: String,
    subprotocols: Option<Vec<String>>,
    config: Config,
    policy: ReconnectPolicy,
    connector: C,
    transport: Option<C::Transport>,
    /// Generation of the held transport; sinks of older generations are ignored
    generation: u64,
    /// The held transport has not reported its close yet
    awaiting_close: bool,
    close_requested: bool,
    restart_requested: bool,
    retry_count: u32,
    reconnect_at: Option<Instant>,
    lifecycle: LifecycleState,
    handlers: Handlers<C, M>,
    events_tx: mpsc::UnboundedSender<Envelope>,
    events_rx: mpsc::UnboundedReceiver<Envelope>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager whose incoming text frames are decoded as JSON [`Value`]s.
    ///
    /// Nothing is opened until [`connect`](Self::connect) is called.
    pub fn new<S: Into<String>>(
        endpoint: S,
        subprotocols: Option<Vec<String>>,
        config: Config,
        connector: C,
    ) -> Self {
        Self::typed(endpoint, subprotocols, config, connector)
    }
}

impl<C, M> ConnectionManager<C, M>
where
    C: Connector,
    M: DeserializeOwned + Send + 'static,
{
    /// Create a manager decoding incoming text frames as `M`.
    pub fn typed<S: Into<String>>(
        endpoint: S,
        subprotocols: Option<Vec<String>>,
        config: Config,
        connector: C,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            endpoint: endpoint.into(),
            subprotocols,
            policy: ReconnectPolicy::from(&config),
            config,
            connector,
            transport: None,
            generation: 0,
            awaiting_close: false,
            close_requested: false,
            restart_requested: false,
            retry_count: 0,
            reconnect_at: None,
            lifecycle: LifecycleState::Idle,
            handlers: Handlers::new(),
            events_tx,
            events_rx,
        }
    }

    /// Open a new transport, discarding the one currently held.
    ///
    /// The previous transport is not closed; it is expected to be closed already or on
    /// its way out. A pending scheduled reconnect is superseded, a pending restart is not.
    /// Whatever the outcome, the previous transport is retired.
    pub fn connect(&mut self) -> Result<()> {
        self.close_requested = false;
        self.reconnect_at = None;

        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let sink = EventSink::new(generation, self.events_tx.clone());

        match self
            .connector
            .open(&self.endpoint, self.subprotocols.as_deref(), sink)
        {
            Ok(transport) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.endpoint, generation, "Opening transport");

                self.transport = Some(transport);
                self.awaiting_close = true;
                self.lifecycle = LifecycleState::Active;
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(endpoint = %self.endpoint, error = %e, "Unable to open transport");

                self.transport = None;
                self.awaiting_close = false;
                self.lifecycle = LifecycleState::Disconnected;
                Err(e)
            }
        }
    }

    /// Serialize `payload` as JSON and hand it to the held transport.
    ///
    /// Returns `false` when no transport is held, when serialization fails, or when the
    /// transport refuses the frame. Never panics and never returns an error.
    pub fn send<P: Serialize + ?Sized>(&mut self, payload: &P) -> bool {
        match self.transmit(payload) {
            Ok(()) => true,
            Err(e) => {
                #[cfg(feature = "tracing")]
                if e.kind() == crate::error::Kind::Encoding {
                    tracing::warn!(error = %e, "Unable to serialize outgoing payload");
                } else {
                    tracing::debug!(error = %e, "Transport rejected outgoing frame");
                }
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                false
            }
        }
    }

    fn transmit<P: Serialize + ?Sized>(&mut self, payload: &P) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(WsError::NotOpen {
                ready_state: ready_state::CLOSED,
            }
            .into());
        };

        let text = serde_json::to_string(payload)?;
        transport.send(text)
    }

    /// Close the held transport for good. No-op when no transport is held.
    ///
    /// Returns immediately; the close handler runs once the transport reports the close.
    pub fn close(&mut self) {
        self.request_close(false);
    }

    /// Tear down the held transport and open a fresh one as soon as it reports closed.
    ///
    /// Bypasses the retry policy entirely. When the held transport already reported its
    /// close (the manager gave up, or reconnection is disabled) the new transport is
    /// opened right away since no further close notification will come. Without a
    /// transport the request stays pending until the next close notification.
    pub fn restart(&mut self) -> Result<()> {
        self.restart_requested = true;
        self.close();

        if self.transport.is_some() && !self.awaiting_close && self.reconnect_at.is_none() {
            self.restart_requested = false;
            return self.connect();
        }

        Ok(())
    }

    fn request_close(&mut self, for_reconnect: bool) {
        if let Some(transport) = self.transport.as_mut() {
            self.close_requested = !for_reconnect;
            transport.close();
        }
    }

    /// Process exactly one transport notification or due reconnect.
    ///
    /// Returns `Ok(false)` without waiting when the lifecycle cannot make progress
    /// anymore: never connected, closed, disconnected or out of retries. Errors are the
    /// ones an internally triggered [`connect`](Self::connect) ran into.
    pub async fn turn(&mut self) -> Result<bool> {
        if !self.awaiting_close && self.reconnect_at.is_none() {
            return Ok(false);
        }

        let deadline = self.reconnect_at;

        tokio::select! {
            Some(envelope) = self.events_rx.recv() => self.dispatch(envelope)?,
            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                self.reconnect_due()?;
            }
        }

        Ok(true)
    }

    /// Drive the connection until it is closed or cannot be recovered automatically.
    pub async fn run(&mut self) -> Result<()> {
        while self.turn().await? {}
        Ok(())
    }

    fn dispatch(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.generation != self.generation
            || self.transport.is_none()
            || !self.awaiting_close
        {
            #[cfg(feature = "tracing")]
            tracing::trace!(
                generation = envelope.generation,
                current = self.generation,
                "Ignoring notification from a retired transport"
            );
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        if self.config.debug_logging {
            tracing::debug!(
                endpoint = %self.endpoint,
                generation = self.generation,
                notification = ?envelope.notification,
                "Transport notification"
            );
        }

        match envelope.notification {
            Notification::Open(event) => self.handle_open(&event),
            Notification::Message(event) => self.handle_message(event),
            Notification::Error(event) => self.handle_error(&event),
            Notification::Close(event) => return self.handle_close(&event),
        }

        Ok(())
    }

    fn handle_open(&mut self, event: &OpenEvent) {
        self.retry_count = 0;

        if let Some(mut handler) = self.handlers.open.take() {
            handler(self, event);
            self.handlers.open.restore(handler);
        }
    }

    fn handle_message(&mut self, event: MessageEvent) {
        let Some(mut handler) = self.handlers.message.take() else {
            return;
        };

        let payload = self.decode(&event.data);
        handler(self, payload, &event);
        self.handlers.message.restore(handler);
    }

    fn decode(&self, data: &Frame) -> Payload<M> {
        if self.config.parse_messages
            && let Frame::Text(text) = data
        {
            match serde_json::from_str::<M>(text) {
                Ok(message) => return Payload::Decoded(message),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(%text, error = %e, "Delivering undecodable message as is");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        }

        Payload::Raw(data.clone())
    }

    fn handle_error(&mut self, event: &ErrorEvent) {
        if let Some(mut handler) = self.handlers.error.take() {
            handler(self, event);
            self.handlers.error.restore(handler);
        }

        // Whether this ends in a reconnect is decided by the close notification.
        self.request_close(true);
    }

    fn handle_close(&mut self, event: &CloseEvent) -> Result<()> {
        self.awaiting_close = false;
        let generation = self.generation;

        if let Some(mut handler) = self.handlers.close.take() {
            handler(self, event);
            self.handlers.close.restore(handler);
        }

        // The handler already opened a new transport.
        if self.generation != generation {
            return Ok(());
        }

        match self.close_outcome() {
            CloseOutcome::Restart => {
                self.restart_requested = false;
                self.connect()
            }
            CloseOutcome::Reconnect => {
                self.schedule_reconnect();
                Ok(())
            }
            CloseOutcome::Terminal => {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.endpoint, code = event.code, "Connection closed");

                self.transport = None;
                self.lifecycle = LifecycleState::Closed;
                Ok(())
            }
        }
    }

    const fn close_outcome(&self) -> CloseOutcome {
        if self.restart_requested {
            CloseOutcome::Restart
        } else if self.close_requested {
            CloseOutcome::Terminal
        } else {
            CloseOutcome::Reconnect
        }
    }

    fn schedule_reconnect(&mut self) {
        let Some(delay) = self.policy.next_delay(self.retry_count) else {
            self.lifecycle = if self.policy.is_enabled() {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    endpoint = %self.endpoint,
                    attempts = self.retry_count,
                    "Giving up reconnecting"
                );
                LifecycleState::GaveUp {
                    attempts: self.retry_count,
                }
            } else {
                LifecycleState::Disconnected
            };
            return;
        };

        self.retry_count = self.retry_count.saturating_add(1);
        self.reconnect_at = Some(deadline_after(delay));
        self.lifecycle = LifecycleState::Reconnecting {
            attempt: self.retry_count,
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            endpoint = %self.endpoint,
            attempt = self.retry_count,
            ?delay,
            "Connection lost, reconnecting"
        );
    }

    fn reconnect_due(&mut self) -> Result<()> {
        self.reconnect_at = None;

        // Closed on request while waiting out the delay.
        if self.close_requested && !self.restart_requested {
            self.transport = None;
            self.lifecycle = LifecycleState::Closed;
            return Ok(());
        }

        self.restart_requested = false;
        self.connect()
    }

    /// Register the open handler, replacing any previous one.
    pub fn on_open<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Self, &OpenEvent) + Send + 'static,
    {
        self.handlers.open.set(Some(Box::new(handler)));
    }

    /// Register the message handler, replacing any previous one.
    ///
    /// The payload is decoded when `parse_messages` is on and decoding succeeds, raw otherwise.
    pub fn on_message<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Self, Payload<M>, &MessageEvent) + Send + 'static,
    {
        self.handlers.message.set(Some(Box::new(handler)));
    }

    /// Register the close handler, replacing any previous one.
    ///
    /// Runs for every close notification, before the manager decides what happens next.
    pub fn on_close<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Self, &CloseEvent) + Send + 'static,
    {
        self.handlers.close.set(Some(Box::new(handler)));
    }

    /// Register the error handler, replacing any previous one.
    pub fn on_error<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Self, &ErrorEvent) + Send + 'static,
    {
        self.handlers.error.set(Some(Box::new(handler)));
    }

    /// Remove the handler registered for `kind`, if any.
    pub fn clear_handler(&mut self, kind: NotificationKind) {
        match kind {
            NotificationKind::Open => self.handlers.open.set(None),
            NotificationKind::Message => self.handlers.message.set(None),
            NotificationKind::Close => self.handlers.close.set(None),
            NotificationKind::Error => self.handlers.error.set(None),
        }
    }

    /// Ready state of the held transport: `CONNECTING`, `OPEN`, `CLOSING` or `CLOSED`.
    #[must_use]
    pub fn current_state(&self) -> Option<&'static str> {
        let transport = self.transport.as_ref()?;
        READY_STATES.get(&transport.ready_state()).copied()
    }

    #[must_use]
    pub fn binary_type(&self) -> Option<&'static str> {
        let transport = self.transport.as_ref()?;
        BINARY_TYPES.get(transport.binary_type()).copied()
    }

    #[must_use]
    pub fn buffered_amount(&self) -> Option<u64> {
        self.transport.as_ref().map(Transport::buffered_amount)
    }

    #[must_use]
    pub fn extensions(&self) -> Option<&str> {
        self.transport.as_ref().map(Transport::extensions)
    }

    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.transport.as_ref().map(Transport::protocol)
    }

    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.transport.as_ref().map(Transport::url)
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn subprotocols(&self) -> Option<&[String]> {
        self.subprotocols.as_deref()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reconnection attempts made since the last successful open.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[must_use]
    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    /// Whether a transport is currently held.
    #[must_use]
    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }
}

/// Roughly 30 years, the fallback when a retry delay would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
