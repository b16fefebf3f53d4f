pub mod cli;
pub mod config;
pub mod handlers;
pub mod server;
pub mod signaling;
pub mod store;

pub use config::Config;
pub use server::{build_router, open_store, serve};
pub use signaling::{GatewayError, SessionRecord, SignalingGateway};
pub use store::{EphemeralStore, MemoryBackend, RedisBackend, StoreBackend, StoreError};
