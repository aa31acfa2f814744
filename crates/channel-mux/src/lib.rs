//! Client-side multiplexer for a channel-based realtime hub.
//!
//! A single WebSocket to the hub carries traffic for every feature in the
//! application. Features register per-channel callbacks with a
//! [`ConnectionManager`]; the manager authenticates, keeps the connection
//! alive with bounded reconnects, tracks which channels the hub advertises,
//! and fans each inbound frame out to the subscribers of its channel.
//!
//! # Features
//! - Token-per-attempt authentication (`auth` / `auth_ack` handshake)
//! - Bounded reconnect with fixed or exponential backoff
//! - Supported-channel snapshot, replaced whenever the hub advertises a list
//! - Panic isolation between subscribers and listeners
//! - [`LegacyFeatureSocket`] for features that still own a dedicated socket
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), channel_mux::Error> {
//! use channel_mux::{ConnectionManager, ManagerConfig, static_token};
//!
//! let url = url::Url::parse("wss://hub.example.com/ws")?;
//! let manager = ConnectionManager::new(ManagerConfig::new(url, static_token("secret")))?;
//!
//! let _status = manager.on_status_change(|state| println!("hub is {state}"));
//! let _reports = manager.subscribe("reports/42", |msg| {
//!     println!("report update: {:?}", msg.data);
//! });
//! // Keep the disposers alive for as long as the callbacks should run.
//! # Ok(())
//! # }
//! ```

mod auth;
pub mod config;
mod connection;
mod events;
mod legacy;
mod manager;
mod policy;
pub mod protocol;
mod registry;
mod types;

pub use auth::{HttpTokenProvider, static_token};
pub use config::{BackoffKind, HubSettings, ManagerConfig, TimingSettings};
pub use events::{ChannelListListener, StatusListener};
pub use legacy::{FetchFn, FetchFuture, LegacyFeatureSocket, LegacySocketConfig};
pub use manager::{ConnectionManager, DebugInfo};
pub use policy::{Backoff, ReconnectPolicy};
pub use protocol::InboundMessage;
pub use registry::ChannelCallback;
pub use types::{BoxError, ConnectionState, Disposer, Error, TokenFuture, TokenProvider};
