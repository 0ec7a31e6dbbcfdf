//! vayu-link - MAVLink transport and dispatch core
//!
//! Connects a ground-side application to vehicles over UDP, TCP, serial
//! lines or an application-provided byte stream, decodes what arrives and
//! hands it to subscribers.
//!
//! ## Layers
//!
//! - [`connection_url`]: connection strings to descriptors
//! - [`connection`]: the links and their receive threads
//! - [`protocol`]: framing, compiled and runtime-schema decoding
//! - [`core`]: handles, callback lists and the callback thread
//! - [`vayu`]: the [`Vayu`] hub tying it together

pub mod config;
pub mod connection;
pub mod connection_url;
pub mod core;
pub mod error;
pub mod protocol;
pub mod vayu;

// Re-export commonly used types
pub use config::SdkConfig;
pub use connection::{ConnectionHandle, ForwardingOption};
pub use connection_url::ConnectionDescriptor;
pub use crate::core::types::{DecodedMessage, FieldValue, JsonMessage, MessagePayload};
pub use error::{Error, Result};
pub use vayu::{JsonMessageHandle, MessageHandle, RawBytesHandle, Vayu};
