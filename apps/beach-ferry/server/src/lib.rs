//! Beach Ferry: pairs a Beach client with its helper under a shared session
//! token and relays their frames, either in-process or across relay processes
//! through Redis pub/sub.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod frame;
pub mod reaper;
pub mod registry;
pub mod relay;
pub mod server;
pub mod telemetry;

pub use config::{Cli, RelayMode, ServerConfig};
pub use connection::ConnectionHandle;
pub use registry::{BindOutcome, SessionRegistry, SlotPolicy, Unbound};
pub use relay::RelayExit;
pub use server::{router, serve, AppState, RelayStrategy};
