//! spark-core: Shared protocol library for Spark.
//!
//! Provides the packet envelope, typed commands, frame encryption, the
//! encrypted duplex channel and the event correlation registry used by both
//! the server and the agent.

pub mod channel;
pub mod command;
pub mod crypto;
pub mod device;
pub mod error;
pub mod event;
pub mod packet;

// Re-export commonly used items at crate root.
pub use channel::{ChannelSlot, FrameSink, SecureChannel, SideChannel, MAX_INLINE_FRAME, WRITE_DEADLINE};
pub use command::{Command, DeviceAction};
pub use crypto::Secret;
pub use device::Device;
pub use error::{SparkError, SparkResult};
pub use event::{new_token, Callback, EventRegistry, PendingReply, RESPONSE_TIMEOUT};
pub use packet::{act, Packet};
