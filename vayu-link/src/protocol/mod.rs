//! MAVLink wire protocol: framing and the two decoding strategies.
//!
//! - [`frame`]: frame scanner, accumulation reader, v2 frame builder
//! - [`receiver`]: compiled-message decoder and the shared receiver trait
//! - [`dynamic_receiver`]: runtime-schema decoder
//! - [`schema`]: XML message definitions and their registry

pub mod dynamic_receiver;
pub mod frame;
pub mod receiver;
pub mod ring_buffer;
pub mod schema;

pub use dynamic_receiver::DynamicReceiver;
pub use receiver::{FixedReceiver, MessageReceiver, ParseResult, ReceiverStats};
pub use schema::SchemaRegistry;
