//! spark-agent: the device side of Spark.
//!
//! Keeps one encrypted websocket to the server, reports host telemetry on an
//! interval, and serves the server's commands: pty terminals, file listing,
//! removal and streamed upload.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod files;
pub mod report;
pub mod terminal;

#[cfg(test)]
mod testing;

pub use config::AgentConfig;
pub use connection::Agent;
