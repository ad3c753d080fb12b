//! spark-server: Spark control server.
//!
//! Accepts agent websocket connections, keeps the device registry, and
//! serves the `/api` HTTP surface operators use to reach devices: correlated
//! commands, streamed file and screenshot relay, and terminal bridging.

pub mod config;
pub mod device;
pub mod handlers;
pub mod hub;
pub mod relay;
pub mod server;
pub mod terminal;
pub mod ws;

#[cfg(test)]
mod testing;

pub use config::ServerConfig;
pub use server::{router, run, AppState};
