//! Self-healing WebSocket connection management.
//!
//! A [`ConnectionManager`] keeps one logical connection alive over a sequence of
//! physical ones, opened through a pluggable [`Connector`].
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: lifecycle state machine, retry policy and handler surface
//! - [`Connector`] / [`Transport`]: the environment that opens and drives physical connections
//! - [`WsConnector`]: `tokio-tungstenite` backed connector (feature `tungstenite`)
//!
//! # Example
//!
//! ```ignore
//! let mut manager = ConnectionManager::new(endpoint, None, Config::default(), WsConnector);
//! manager.on_message(|_, payload, _| println!("{payload:?}"));
//! manager.connect()?;
//! manager.run().await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod traits;
#[cfg(feature = "tungstenite")]
pub mod transport;

pub use connection::{ConnectionManager, LifecycleState, Payload};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
#[cfg(feature = "tungstenite")]
pub use transport::{WsConnector, WsTransport};
