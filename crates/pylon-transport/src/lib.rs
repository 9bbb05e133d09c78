//! Pylon host transport.
//!
//! Couples two transports to one command surface:
//! - `LocalFanout`/`serve_local` - WebSocket fan-out for local clients
//! - `RelayClient` - outbound relay link with fixed-backoff reconnect
//! - `Dispatcher` - the Pylon's application command surface

pub mod dispatch;
pub mod local_server;
pub mod relay_client;

pub use dispatch::{Dispatcher, Origin, SessionTaskRunner};
pub use local_server::{LocalConfig, LocalFanout, serve_local};
pub use relay_client::{RelayClient, RelayClientConfig, TransportError};
