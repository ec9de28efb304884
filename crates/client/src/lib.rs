//! WebSocket client.
//!
//! ```no_run
//! # async fn demo() -> Result<(), corews_client::ClientError> {
//! use corews_client::{Client, ClientConfig, ClientEvent};
//!
//! let client = Client::connect("ws://127.0.0.1:9000/", &[], ClientConfig::default()).await?;
//! let mut events = client.take_events().await.expect("first take");
//! client.spawn().await?;
//! client.send_text("ping");
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::Text(text) = event {
//!         println!("{text}");
//!         break;
//!     }
//! }
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod endpoint;
pub mod event;

use std::time::Duration;

use corews_connection::ConnectionError;

pub use client::Client;
pub use config::ClientConfig;
pub use endpoint::WsUrl;
pub use event::ClientEvent;

/// Errors from the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("run loop already started")]
    AlreadyRunning,
}
