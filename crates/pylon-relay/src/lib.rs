//! Relay hub: device registry plus pub/sub envelope routing.
//!
//! The relay never interprets application payloads. It registers
//! devices, routes envelopes by `to`/`broadcast`/default-all, and
//! synthesizes a small set of diagnostic replies.

pub mod hub;
pub mod server;

pub use hub::{Device, RelayHub};
pub use server::{RelayConfig, serve};
