#![allow(
    dead_code,
    reason = "Each integration test binary uses a different subset of these helpers"
)]

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resilient_ws::Result;
use resilient_ws::error::Error;
use resilient_ws::ws::connection::ready_state::{CLOSED, CONNECTING, OPEN};
use resilient_ws::ws::{
    CloseEvent, ConnectionManager, Connector, ErrorEvent, EventSink, MessageEvent, Notification,
    OpenEvent, Transport, WsError,
};
use serde::de::DeserializeOwned;
use tokio::time::{sleep, timeout};

/// How long a mock socket takes to open (or fail to).
pub const OPEN_DELAY: Duration = Duration::from_millis(10);
/// How long a mock socket takes to echo a frame or report a requested close.
pub const REPLY_DELAY: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct MockState {
    sockets: Vec<Arc<MockSocket>>,
    fail_next: usize,
    fail_all: bool,
    refuse_open: bool,
    emit_before_refusing: bool,
}

/// Scripted [`Connector`] that records every socket it opens.
///
/// Sockets open after [`OPEN_DELAY`] unless told to fail, and echo every sent frame
/// back after [`REPLY_DELAY`].
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connections fail with an error and an abnormal close.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().unwrap().fail_next = count;
    }

    pub fn fail_all(&self, fail: bool) {
        self.state.lock().unwrap().fail_all = fail;
    }

    /// Make `open` itself return an error.
    pub fn refuse_open(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_open = refuse;
    }

    /// Like [`refuse_open`](Self::refuse_open), but an open notification is pushed
    /// into the sink before the error is returned.
    pub fn refuse_open_after_emitting(&self) {
        let mut state = self.state.lock().unwrap();
        state.refuse_open = true;
        state.emit_before_refusing = true;
    }

    #[must_use]
    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().sockets.len()
    }

    #[must_use]
    pub fn socket(&self, index: usize) -> Arc<MockSocket> {
        Arc::clone(&self.state.lock().unwrap().sockets[index])
    }

    #[must_use]
    pub fn last(&self) -> Arc<MockSocket> {
        let state = self.state.lock().unwrap();
        Arc::clone(state.sockets.last().unwrap())
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    fn open(
        &self,
        endpoint: &str,
        subprotocols: Option<&[String]>,
        sink: EventSink,
    ) -> Result<MockTransport> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_open {
            if state.emit_before_refusing {
                sink.emit(Notification::Open(OpenEvent::new()));
            }
            return Err(Error::validation("connector refused to open"));
        }

        let fail = if state.fail_next > 0 {
            state.fail_next -= 1;
            true
        } else {
            state.fail_all
        };

        let socket = Arc::new(MockSocket {
            url: endpoint.to_owned(),
            subprotocols: subprotocols.map(<[String]>::to_vec),
            ready_state: AtomicU8::new(CONNECTING),
            sink,
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
        });
        state.sockets.push(Arc::clone(&socket));

        let opening = Arc::clone(&socket);
        tokio::spawn(async move {
            sleep(OPEN_DELAY).await;
            if opening.ready_state() != CONNECTING {
                return;
            }
            if fail {
                opening.ready_state.store(CLOSED, Ordering::SeqCst);
                opening.emit(Notification::Error(ErrorEvent::new("connection refused")));
                opening.emit(Notification::Close(CloseEvent::abnormal("Connection failed")));
            } else {
                opening.ready_state.store(OPEN, Ordering::SeqCst);
                opening.emit(Notification::Open(OpenEvent::new()));
            }
        });

        Ok(MockTransport { socket })
    }
}

/// Server side view of one mock connection.
#[derive(Debug)]
pub struct MockSocket {
    pub url: String,
    pub subprotocols: Option<Vec<String>>,
    ready_state: AtomicU8,
    sink: EventSink,
    sent: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
}

impl MockSocket {
    fn emit(&self, notification: Notification) {
        self.sink.emit(notification);
    }

    #[must_use]
    pub fn ready_state(&self) -> u8 {
        self.ready_state.load(Ordering::SeqCst)
    }

    /// Frames the client handed to this socket.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Deliver a text frame from the server.
    pub fn push(&self, text: &str) {
        self.emit(Notification::Message(MessageEvent::text(text)));
    }

    /// The network goes away without a close handshake.
    pub fn drop_connection(&self) {
        self.ready_state.store(CLOSED, Ordering::SeqCst);
        self.emit(Notification::Close(CloseEvent::abnormal("connection reset")));
    }

    /// A transport error immediately followed by the resulting close.
    pub fn error_and_close(&self) {
        self.ready_state.store(CLOSED, Ordering::SeqCst);
        self.emit(Notification::Error(ErrorEvent::new("network unreachable")));
        self.emit(Notification::Close(CloseEvent::abnormal("network unreachable")));
    }
}

#[derive(Debug)]
pub struct MockTransport {
    socket: Arc<MockSocket>,
}

impl Transport for MockTransport {
    fn send(&mut self, text: String) -> Result<()> {
        let ready_state = self.socket.ready_state();
        if ready_state != OPEN {
            return Err(WsError::NotOpen { ready_state }.into());
        }

        self.socket.sent.lock().unwrap().push(text.clone());

        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            sleep(REPLY_DELAY).await;
            socket.push(&text);
        });

        Ok(())
    }

    fn close(&mut self) {
        self.socket.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.socket.ready_state.swap(CLOSED, Ordering::SeqCst) == CLOSED {
            return;
        }

        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            sleep(REPLY_DELAY).await;
            socket.emit(Notification::Close(CloseEvent::new(1000, "Normal closure")));
        });
    }

    fn ready_state(&self) -> u8 {
        self.socket.ready_state()
    }

    fn binary_type(&self) -> &str {
        "blob"
    }

    fn buffered_amount(&self) -> u64 {
        0
    }

    fn extensions(&self) -> &str {
        ""
    }

    fn protocol(&self) -> &str {
        self.socket
            .subprotocols
            .as_ref()
            .and_then(|protocols| protocols.first())
            .map_or("", String::as_str)
    }

    fn url(&self) -> &str {
        &self.socket.url
    }
}

/// Let the manager process events for `duration` of (paused) time.
pub async fn drive<C, M>(manager: &mut ConnectionManager<C, M>, duration: Duration) -> Result<()>
where
    C: Connector,
    M: DeserializeOwned + Send + 'static,
{
    timeout(duration, manager.run()).await.unwrap_or(Ok(()))
}
