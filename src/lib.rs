//! Multi-client TCP Chat Relay Library
//!
//! Clients connect over TCP, announce an identifier in their first read,
//! and every later fragment they send is relayed to all other connected
//! clients as `"<identifier>> <text>\0"`.
//!
//! # Architecture
//! - `SlotTable` is a fixed-capacity registry guarded by one lock; reserve,
//!   release, identifier assignment and broadcast iteration are mutually
//!   exclusive and never perform I/O while holding it
//! - Each connection is served by its own worker task (see `worker`)
//! - `BroadcastRelay` snapshots recipients under the table lock and writes
//!   to them after releasing it
//! - `ShutdownCoordinator` cancels workers cooperatively and joins them
//!
//! A full table rejects new connections: the stream is closed immediately.
//!
//! # Example
//! ```ignore
//! use chat_relay::{RelayConfig, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), chat_relay::RelayError> {
//!     let server = RelayServer::bind("127.0.0.1:8080", RelayConfig::default()).await?;
//!     server.run_until_ctrl_c().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod slot;
pub mod table;
pub mod types;
pub mod worker;

// Re-export main types for convenience
pub use config::RelayConfig;
pub use error::{DeliveryError, RelayError, TableError};
pub use message::RelayMessage;
pub use relay::{BroadcastRelay, DeliveryReport};
pub use server::{RelayServer, ServerHandle};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use slot::{ClientSlot, Outbound};
pub use table::{SlotInfo, SlotTable};
pub use types::{Identifier, SlotIndex, SlotLease};
pub use worker::{admit, WorkerContext};
