//! Chunked blob transfer engine.
//!
//! Implements the `blob_start` / `blob_chunk` / `blob_end` / `blob_request`
//! protocol: indexed chunk slots tolerate out-of-order arrival, reassembly
//! happens only once every slot is filled, and an optional
//! `sha256:<hex>` checksum guards the reassembled bytes.

pub mod engine;
pub mod mime;

pub use engine::{
    BlobEngine, BlobError, ChunkAck, EndAck, StartAck,
    StartPayload, ChunkPayload, EndPayload, RequestPayload, checksum_of,
};
pub use mime::mime_for_path;
