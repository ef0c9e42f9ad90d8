#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    #[cfg(feature = "tungstenite")]
    Connection(tokio_tungstenite::tungstenite::Error),
    /// A frame was handed to a transport that is not in the `OPEN` state
    NotOpen {
        /// Ready state code of the transport at the time of the send
        ready_state: u8,
    },
    /// The transport's socket task has already terminated
    ConnectionClosed,
    /// No async runtime was available to drive the socket
    NoRuntime,
    /// A subprotocol name cannot be sent in a handshake header
    InvalidSubprotocol(String),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "tungstenite")]
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::NotOpen { ready_state } => {
                write!(f, "WebSocket is not open (ready state {ready_state})")
            }
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::NoRuntime => write!(f, "No tokio runtime available to drive the WebSocket"),
            Self::InvalidSubprotocol(name) => write!(f, "Invalid subprotocol: {name:?}"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            #[cfg(feature = "tungstenite")]
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Transport, e)
    }
}

#[cfg(feature = "tungstenite")]
impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Transport, WsError::Connection(e))
    }
}
