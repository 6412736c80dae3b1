//! Payload storage for item parts.

mod external;
mod helper;
mod streamer;

pub use external::ExternalPartStorage;
pub use helper::{PartColumn, PartHelper};
pub use streamer::{PartMetaData, PartStreamer, StreamOutcome, StreamPeer};
