//! Runtime (dynamic) message schema
//!
//! - [`definition::MessageDef`]: one message parsed from MAVLink XML, with
//!   wire layout, CRC extra, decode and encode
//! - [`registry::SchemaRegistry`]: shared, lock-protected set of definitions

pub mod definition;
pub mod registry;

pub use definition::{FieldDef, MessageDef, PrimitiveType};
pub use registry::SchemaRegistry;
