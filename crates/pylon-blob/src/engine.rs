//! Blob transfer table and protocol operations.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use pylon_core::{Envelope, envelope::types, now_millis};

use crate::mime::mime_for_path;

/// Default chunk size for outbound transfers (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Blob protocol error.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),
    #[error("missing chunks: received {received}/{total}")]
    MissingChunks { received: u32, total: u32 },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// `blob_start` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub blob_id: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub total_size: u64,
    pub total_chunks: u32,
    #[serde(default)]
    pub same_device: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    /// Sending device id, used as the per-context save subdirectory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

/// `blob_chunk` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub blob_id: String,
    pub index: u32,
    /// Base64-encoded chunk bytes.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// `blob_end` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndPayload {
    pub blob_id: String,
    /// `sha256:<hex>` over the whole file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_received: Option<u32>,
}

/// `blob_request` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<String>,
}

/// Successful `start` acknowledgement.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAck {
    pub blob_id: String,
    pub save_path: String,
    /// True when no bytes will move (same-device local path).
    pub skipped: bool,
}

/// Successful `chunk` acknowledgement.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub blob_id: String,
    pub received: u32,
    pub total: u32,
}

/// Successful `end` acknowledgement.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndAck {
    pub blob_id: String,
    pub path: String,
    pub size: u64,
}

struct Transfer {
    total_size: u64,
    total_chunks: u32,
    chunks: Vec<Option<Bytes>>,
    received_count: u32,
    save_path: PathBuf,
    completed: bool,
    same_device: bool,
}

/// Chunked transfer engine.
///
/// The transfer table is the single owner of all buffered chunk data;
/// slots are released on completion or cleanup.
pub struct BlobEngine {
    root: PathBuf,
    chunk_size: usize,
    transfers: Mutex<HashMap<String, Transfer>>,
}

impl BlobEngine {
    /// Create an engine storing received blobs under `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self::with_chunk_size(root, DEFAULT_CHUNK_SIZE)
    }

    /// Create an engine with a non-default outbound chunk size.
    #[must_use]
    pub fn with_chunk_size(root: PathBuf, chunk_size: usize) -> Self {
        Self {
            root,
            chunk_size,
            transfers: Mutex::new(HashMap::new()),
        }
    }

    /// Default storage root under the platform data directory.
    #[must_use]
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pylon")
            .join("blobs")
    }

    /// Begin a transfer.
    ///
    /// Same-device transfers with an existing local path complete
    /// immediately; no chunk data will be buffered for them.
    ///
    /// # Errors
    /// Returns `FileNotFound` if a same-device local path does not exist.
    pub fn start(&self, payload: StartPayload) -> Result<StartAck, BlobError> {
        if payload.same_device {
            let local = payload
                .local_path
                .as_ref()
                .ok_or_else(|| BlobError::FileNotFound("missing localPath".into()))?;
            let local_path = PathBuf::from(local);
            if !local_path.exists() {
                return Err(BlobError::FileNotFound(local.clone()));
            }

            self.transfers.lock().unwrap().insert(
                payload.blob_id.clone(),
                Transfer {
                    total_size: payload.total_size,
                    total_chunks: payload.total_chunks,
                    chunks: Vec::new(),
                    received_count: 0,
                    save_path: local_path,
                    completed: true,
                    same_device: true,
                },
            );

            return Ok(StartAck {
                blob_id: payload.blob_id,
                save_path: local.clone(),
                skipped: true,
            });
        }

        let subdir = payload.sender_id.as_deref().unwrap_or("unknown");
        let save_path = self
            .root
            .join(sanitize_component(subdir))
            .join(format!(
                "{}_{}",
                now_millis(),
                sanitize_filename(&payload.filename)
            ));

        let total = payload.total_chunks as usize;
        self.transfers.lock().unwrap().insert(
            payload.blob_id.clone(),
            Transfer {
                total_size: payload.total_size,
                total_chunks: payload.total_chunks,
                chunks: vec![None; total],
                received_count: 0,
                save_path: save_path.clone(),
                completed: false,
                same_device: false,
            },
        );

        Ok(StartAck {
            blob_id: payload.blob_id,
            save_path: save_path.to_string_lossy().into_owned(),
            skipped: false,
        })
    }

    /// Accept one chunk. Indices are independent slots; out-of-order
    /// arrival is expected and refilling a slot does not double-count.
    ///
    /// # Errors
    /// Returns `UnknownTransfer` for an unstarted blob id, or
    /// `MalformedChunk` for bad base64 / out-of-range index.
    pub fn chunk(&self, payload: ChunkPayload) -> Result<ChunkAck, BlobError> {
        let mut transfers = self.transfers.lock().unwrap();
        let transfer = transfers
            .get_mut(&payload.blob_id)
            .ok_or_else(|| BlobError::UnknownTransfer(payload.blob_id.clone()))?;

        if transfer.same_device {
            // Acknowledge without buffering; the bytes never move.
            return Ok(ChunkAck {
                blob_id: payload.blob_id,
                received: transfer.received_count,
                total: transfer.total_chunks,
            });
        }

        let index = payload.index as usize;
        if index >= transfer.chunks.len() {
            return Err(BlobError::MalformedChunk(format!(
                "chunk index {index} out of range for {} chunks",
                transfer.total_chunks
            )));
        }

        let bytes = BASE64
            .decode(&payload.data)
            .map_err(|e| BlobError::MalformedChunk(format!("invalid base64: {e}")))?;

        if transfer.chunks[index].is_none() {
            transfer.received_count += 1;
        }
        transfer.chunks[index] = Some(Bytes::from(bytes));

        Ok(ChunkAck {
            blob_id: payload.blob_id,
            received: transfer.received_count,
            total: transfer.total_chunks,
        })
    }

    /// Finish a transfer: reassemble in index order, verify the checksum
    /// if supplied, persist, and release chunk memory.
    ///
    /// Failures abort the transfer and discard its partial state.
    ///
    /// # Errors
    /// Returns `MissingChunks` or `ChecksumMismatch` on an incomplete or
    /// corrupt transfer, `UnknownTransfer` for an unstarted blob id.
    pub async fn end(&self, payload: EndPayload) -> Result<EndAck, BlobError> {
        let (save_path, data) = {
            let mut transfers = self.transfers.lock().unwrap();
            let transfer = transfers
                .get_mut(&payload.blob_id)
                .ok_or_else(|| BlobError::UnknownTransfer(payload.blob_id.clone()))?;

            if transfer.same_device || transfer.completed {
                transfer.completed = true;
                return Ok(EndAck {
                    blob_id: payload.blob_id,
                    path: transfer.save_path.to_string_lossy().into_owned(),
                    size: transfer.total_size,
                });
            }

            if transfer.received_count != transfer.total_chunks {
                let err = BlobError::MissingChunks {
                    received: transfer.received_count,
                    total: transfer.total_chunks,
                };
                transfers.remove(&payload.blob_id);
                return Err(err);
            }

            let mut data = Vec::new();
            for slot in &transfer.chunks {
                // received_count == total_chunks guarantees every slot is filled
                if let Some(chunk) = slot {
                    data.extend_from_slice(chunk);
                }
            }

            if let Some(expected) = &payload.checksum {
                let actual = checksum_of(&data);
                if *expected != actual {
                    let err = BlobError::ChecksumMismatch {
                        expected: expected.clone(),
                        actual,
                    };
                    transfers.remove(&payload.blob_id);
                    return Err(err);
                }
            }

            transfer.completed = true;
            transfer.chunks = Vec::new();
            transfer.received_count = 0;
            (transfer.save_path.clone(), data)
        };

        if let Some(parent) = save_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&save_path, &data).await?;
        tracing::info!("Blob {} saved to {}", payload.blob_id, save_path.display());

        Ok(EndAck {
            blob_id: payload.blob_id,
            path: save_path.to_string_lossy().into_owned(),
            size: data.len() as u64,
        })
    }

    /// Serve a file as a deterministic `blob_start` / `blob_chunk`* /
    /// `blob_end` envelope sequence on `sink`.
    ///
    /// # Errors
    /// Returns `FileNotFound` if neither the explicit path nor a
    /// recursive filename search under the storage root locates the file.
    pub async fn request(
        &self,
        payload: RequestPayload,
        sink: &mpsc::UnboundedSender<Envelope>,
    ) -> Result<String, BlobError> {
        let path = self.locate(&payload)?;
        let data = tokio::fs::read(&path).await?;

        let blob_id = payload
            .blob_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let filename = path
            .file_name()
            .map_or_else(|| "blob".to_string(), |n| n.to_string_lossy().into_owned());
        let total_chunks = u32::try_from(data.len().div_ceil(self.chunk_size)).unwrap_or(u32::MAX);

        let start = StartPayload {
            blob_id: blob_id.clone(),
            filename,
            mime_type: Some(mime_for_path(&path).to_string()),
            total_size: data.len() as u64,
            total_chunks,
            same_device: false,
            local_path: None,
            sender_id: None,
        };
        send_payload(sink, types::BLOB_START, &start);

        for (index, chunk) in data.chunks(self.chunk_size).enumerate() {
            let chunk_payload = ChunkPayload {
                blob_id: blob_id.clone(),
                index: u32::try_from(index).unwrap_or(u32::MAX),
                data: BASE64.encode(chunk),
                size: Some(chunk.len() as u64),
            };
            send_payload(sink, types::BLOB_CHUNK, &chunk_payload);
        }

        let end = EndPayload {
            blob_id: blob_id.clone(),
            checksum: Some(checksum_of(&data)),
            total_received: Some(total_chunks),
        };
        send_payload(sink, types::BLOB_END, &end);

        Ok(blob_id)
    }

    /// Drop a transfer and release its buffered chunks.
    pub fn cleanup(&self, blob_id: &str) {
        self.transfers.lock().unwrap().remove(blob_id);
    }

    fn locate(&self, payload: &RequestPayload) -> Result<PathBuf, BlobError> {
        if let Some(path) = &payload.path {
            let candidate = PathBuf::from(path);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        if let Some(filename) = &payload.filename {
            if let Some(found) = find_file(&self.root, filename) {
                return Ok(found);
            }
        }
        Err(BlobError::FileNotFound(
            payload
                .path
                .clone()
                .or_else(|| payload.filename.clone())
                .unwrap_or_else(|| "<unspecified>".into()),
        ))
    }
}

fn send_payload<T: Serialize>(sink: &mpsc::UnboundedSender<Envelope>, kind: &str, payload: &T) {
    match serde_json::to_value(payload) {
        Ok(value) => {
            let _ = sink.send(Envelope::with_payload(kind, value));
        }
        Err(e) => tracing::error!("Failed to serialize {kind} payload: {e}"),
    }
}

/// `sha256:<hex>` over `data`.
#[must_use]
pub fn checksum_of(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{:x}", hasher.finalize())
}

fn sanitize_filename(filename: &str) -> String {
    // Strip any path components first.
    let name = Path::new(filename)
        .file_name()
        .map_or_else(|| "blob".to_string(), |n| n.to_string_lossy().into_owned());
    sanitize_component(&name)
}

fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn find_file(root: &Path, filename: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(root).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file(&path, filename) {
                return Some(found);
            }
        } else if path.file_name().is_some_and(|n| n == filename) {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_payload(blob_id: &str, size: u64, chunks: u32) -> StartPayload {
        StartPayload {
            blob_id: blob_id.into(),
            filename: "photo.png".into(),
            mime_type: None,
            total_size: size,
            total_chunks: chunks,
            same_device: false,
            local_path: None,
            sender_id: Some("desktop-1".into()),
        }
    }

    fn chunk_payload(blob_id: &str, index: u32, data: &[u8]) -> ChunkPayload {
        ChunkPayload {
            blob_id: blob_id.into(),
            index,
            data: BASE64.encode(data),
            size: Some(data.len() as u64),
        }
    }

    #[tokio::test]
    async fn out_of_order_chunks_reassemble_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::new(dir.path().to_path_buf());

        let original: Vec<u8> = (0u16..1000).flat_map(u16::to_le_bytes).collect();
        let parts: Vec<&[u8]> = original.chunks(400).collect();
        engine
            .start(start_payload("b1", original.len() as u64, parts.len() as u32))
            .unwrap();

        // Deliver in a scrambled permutation of indices.
        for &index in &[3usize, 0, 4, 1, 2] {
            engine
                .chunk(chunk_payload("b1", index as u32, parts[index]))
                .unwrap();
        }

        let ack = engine
            .end(EndPayload {
                blob_id: "b1".into(),
                checksum: Some(checksum_of(&original)),
                total_received: Some(5),
            })
            .await
            .unwrap();

        let written = std::fs::read(&ack.path).unwrap();
        assert_eq!(written, original);
    }

    #[tokio::test]
    async fn missing_chunk_fails_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::new(dir.path().to_path_buf());

        engine.start(start_payload("b2", 5000, 5)).unwrap();
        for index in 0..4u32 {
            engine
                .chunk(chunk_payload("b2", index, &[index as u8; 1000]))
                .unwrap();
        }

        let err = engine
            .end(EndPayload {
                blob_id: "b2".into(),
                checksum: None,
                total_received: Some(4),
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BlobError::MissingChunks { received: 4, total: 5 }
        ));
        assert!(err.to_string().contains("4/5"));

        // No output file, and the partial transfer is gone.
        let files: Vec<_> = walk(dir.path());
        assert!(files.is_empty(), "unexpected files: {files:?}");
        assert!(matches!(
            engine.chunk(chunk_payload("b2", 4, &[0u8; 10])),
            Err(BlobError::UnknownTransfer(_))
        ));
    }

    #[tokio::test]
    async fn checksum_mismatch_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::new(dir.path().to_path_buf());

        engine.start(start_payload("b3", 4, 1)).unwrap();
        engine.chunk(chunk_payload("b3", 0, b"data")).unwrap();

        let err = engine
            .end(EndPayload {
                blob_id: "b3".into(),
                checksum: Some("sha256:0000".into()),
                total_received: Some(1),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BlobError::ChecksumMismatch { .. }));
        assert!(walk(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn same_device_short_circuits_without_buffering() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("already_here.png");
        std::fs::write(&local, b"local bytes").unwrap();

        let engine = BlobEngine::new(dir.path().join("store"));
        let ack = engine
            .start(StartPayload {
                blob_id: "b4".into(),
                filename: "already_here.png".into(),
                mime_type: None,
                total_size: 11,
                total_chunks: 1,
                same_device: true,
                local_path: Some(local.to_string_lossy().into_owned()),
                sender_id: None,
            })
            .unwrap();
        assert!(ack.skipped);

        // Chunks are acknowledged but never stored.
        let chunk_ack = engine.chunk(chunk_payload("b4", 0, b"ignored")).unwrap();
        assert_eq!(chunk_ack.received, 0);

        let end_ack = engine
            .end(EndPayload {
                blob_id: "b4".into(),
                checksum: None,
                total_received: None,
            })
            .await
            .unwrap();
        assert_eq!(end_ack.path, local.to_string_lossy());
        assert_eq!(end_ack.size, 11);
    }

    #[tokio::test]
    async fn unknown_transfer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::new(dir.path().to_path_buf());
        assert!(matches!(
            engine.chunk(chunk_payload("nope", 0, b"x")),
            Err(BlobError::UnknownTransfer(_))
        ));
    }

    #[tokio::test]
    async fn request_emits_consistent_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sub").join("dir");
        std::fs::create_dir_all(&nested).unwrap();
        let content: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(nested.join("big.bin"), &content).unwrap();

        let engine = BlobEngine::new(dir.path().to_path_buf());
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .request(
                RequestPayload {
                    path: None,
                    filename: Some("big.bin".into()),
                    blob_id: None,
                },
                &tx,
            )
            .await
            .unwrap();
        drop(tx);

        let mut envelopes = Vec::new();
        while let Some(env) = rx.recv().await {
            envelopes.push(env);
        }

        let start: StartPayload =
            serde_json::from_value(envelopes[0].payload.clone()).unwrap();
        assert_eq!(envelopes[0].kind, "blob_start");
        assert_eq!(
            start.total_chunks as usize,
            content.len().div_ceil(DEFAULT_CHUNK_SIZE)
        );

        // start + chunks + end
        assert_eq!(envelopes.len(), 2 + start.total_chunks as usize);

        let mut reassembled = Vec::new();
        for (i, env) in envelopes[1..envelopes.len() - 1].iter().enumerate() {
            assert_eq!(env.kind, "blob_chunk");
            let chunk: ChunkPayload = serde_json::from_value(env.payload.clone()).unwrap();
            assert_eq!(chunk.index as usize, i);
            reassembled.extend_from_slice(&BASE64.decode(&chunk.data).unwrap());
        }
        assert_eq!(reassembled, content);

        let end: EndPayload =
            serde_json::from_value(envelopes.last().unwrap().payload.clone()).unwrap();
        assert_eq!(end.checksum.unwrap(), checksum_of(&content));
    }

    #[tokio::test]
    async fn request_for_absent_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlobEngine::new(dir.path().to_path_buf());
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = engine
            .request(
                RequestPayload {
                    path: None,
                    filename: Some("ghost.png".into()),
                    blob_id: None,
                },
                &tx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::FileNotFound(_)));
    }

    fn walk(root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Ok(entries) = std::fs::read_dir(root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    files.extend(walk(&path));
                } else {
                    files.push(path);
                }
            }
        }
        files
    }
}
