//! Core building blocks shared by every connection and subscriber.
//!
//! - [`callback_list::CallbackList`]: reentrant-safe publish/subscribe
//! - [`handle`]: typed subscription tokens
//! - [`executor::CallbackExecutor`]: thread running user callbacks
//! - [`types`]: decoded messages and field values

pub mod callback_list;
pub mod executor;
pub mod handle;
pub mod types;
