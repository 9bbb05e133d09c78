//! Shared building blocks for the pylon workspace.
//!
//! This crate provides:
//! - `Envelope` - the wire message format shared by Relay, Pylon and Desktop
//! - `MessageStore` - capped per-session message log with debounced persistence
//! - `Debouncer` - arm-on-write / flush-on-timer persistence helper

pub mod debounce;
pub mod envelope;
pub mod message_store;

pub use debounce::Debouncer;
pub use envelope::{BroadcastClass, DeviceRef, DeviceType, Envelope, now_millis};
pub use message_store::{MessageStore, StoreError, StoredMessage};
