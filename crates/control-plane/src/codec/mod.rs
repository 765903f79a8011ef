//! Wire codecs for the client control channel.
//!
//! Two layers: [`frame`] turns a TCP byte stream into length-prefixed
//! payloads, and [`message`] turns a payload into a structured control
//! message.

pub mod frame;
pub mod message;

pub use frame::{encode_frame, FrameDecoder};
pub use message::{ControlMessage, Verb};
