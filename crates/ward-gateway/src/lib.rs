//! HTTP and websocket front door for Ward call dispatch.
//!
//! Routes and socket frames are thin adapters over the shared dispatcher and
//! reconciler; the gateway also owns the live recipient registry and fans
//! status changes back out to connected sockets.

mod api_error;
pub mod bootstrap;
pub mod cli;
pub mod directory;
pub mod presence_observer;
pub mod server;
mod websocket;
pub mod ws_protocol;


pub use bootstrap::{build_ward_gateway_state, init_tracing, run_ward_gateway_server};
pub use cli::WardGatewayCli;
pub use directory::{load_ward_directory, parse_ward_directory, WardDirectory};
pub use presence_observer::{PresenceBroadcastObserver, CALL_STATUS_PUSH_KIND};
pub use server::{build_ward_gateway_router, WardGatewayState, WS_ENDPOINT};
