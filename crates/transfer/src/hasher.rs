//! Streaming content hash of a whole file.
//!
//! The digest runs on a blocking worker thread that owns the digest state.
//! The caller only sees a bounded stream of [`HashMessage`]s: one `Progress`
//! per consumed chunk, then exactly one terminal `Done` or `Failed`.

use std::sync::Arc;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::TransferError;
use crate::chunker::ChunkSlice;
use crate::source::{ChunkSource, UploadFile};

/// Capacity of the hasher → caller message channel.
pub const HASH_CHANNEL_CAPACITY: usize = 64;

/// Digest used to identify the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl HashAlgorithm {
    /// One-shot hex digest of `data`.
    pub fn digest(self, data: &[u8]) -> String {
        match self {
            Self::Md5 => hex::encode(Md5::digest(data)),
            Self::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }
}

/// Message sent from the hash worker to its caller.
#[derive(Debug)]
pub enum HashMessage {
    /// Chunk `index` has been folded into the digest.
    Progress { index: usize, percent: f64 },
    /// All chunks consumed; lowercase hex identifier.
    Done { file_hash: String },
    /// Reading chunk `index` failed; no `Done` follows.
    Failed { index: usize, error: TransferError },
}

/// Spawns hash workers.
pub struct FileHasher;

impl FileHasher {
    /// Starts hashing `chunks` of `file` in index order.
    pub fn spawn(file: &UploadFile, chunks: Vec<ChunkSlice>, algorithm: HashAlgorithm) -> HashHandle {
        let (tx, rx) = mpsc::channel(HASH_CHANNEL_CAPACITY);
        let source = file.source();
        let task = tokio::task::spawn_blocking(move || match algorithm {
            HashAlgorithm::Md5 => run_digest::<Md5>(source, chunks, tx),
            HashAlgorithm::Sha256 => run_digest::<Sha256>(source, chunks, tx),
        });
        HashHandle { rx, task }
    }
}

fn run_digest<D: Digest>(
    source: Arc<dyn ChunkSource>,
    mut chunks: Vec<ChunkSlice>,
    tx: mpsc::Sender<HashMessage>,
) {
    chunks.sort_by_key(|c| c.index);
    let total = chunks.len();
    let mut digest = D::new();

    for (consumed, slice) in chunks.iter().enumerate() {
        let bytes = match source.read_slice(slice) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(index = slice.index, error = %error, "hash read failed");
                let _ = tx.blocking_send(HashMessage::Failed {
                    index: slice.index,
                    error,
                });
                return;
            }
        };
        digest.update(&bytes);

        let percent = (consumed + 1) as f64 / total as f64 * 100.0;
        let progress = HashMessage::Progress {
            index: slice.index,
            percent,
        };
        if tx.blocking_send(progress).is_err() {
            debug!("hash receiver dropped, stopping worker");
            return;
        }
    }

    let file_hash = hex::encode(digest.finalize());
    debug!(chunks = total, %file_hash, "file hash complete");
    let _ = tx.blocking_send(HashMessage::Done { file_hash });
}

/// Receiving end of a running hash worker.
pub struct HashHandle {
    rx: mpsc::Receiver<HashMessage>,
    task: JoinHandle<()>,
}

impl HashHandle {
    /// Next message, or `None` once the worker has exited.
    pub async fn recv(&mut self) -> Option<HashMessage> {
        self.rx.recv().await
    }

    /// Why the worker exited without a terminal message. Call once
    /// [`recv`](Self::recv) has returned `None`.
    pub async fn stopped(self) -> TransferError {
        match self.task.await {
            Ok(()) => TransferError::WorkerStopped("hash worker exited without a result".into()),
            Err(e) => TransferError::WorkerStopped(format!("hash worker panicked: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::create_chunks;
    use bytes::Bytes;

    async fn finish(
        mut handle: HashHandle,
        seen: &mut Vec<usize>,
    ) -> Result<String, TransferError> {
        while let Some(message) = handle.recv().await {
            match message {
                HashMessage::Progress { index, .. } => seen.push(index),
                HashMessage::Done { file_hash } => return Ok(file_hash),
                HashMessage::Failed { error, .. } => return Err(error),
            }
        }
        Err(handle.stopped().await)
    }

    async fn collect(mut handle: HashHandle) -> Vec<HashMessage> {
        let mut messages = Vec::new();
        while let Some(m) = handle.recv().await {
            messages.push(m);
        }
        messages
    }

    #[tokio::test]
    async fn hash_matches_one_shot_digest() {
        let data = b"The quick brown fox jumps over the lazy dog".to_vec();
        let file = UploadFile::from_bytes("fox.txt", data.clone());

        for algorithm in [HashAlgorithm::Md5, HashAlgorithm::Sha256] {
            let chunks = create_chunks(file.len(), 10).unwrap();
            let hash = finish(FileHasher::spawn(&file, chunks, algorithm), &mut Vec::new())
                .await
                .unwrap();
            assert_eq!(hash, algorithm.digest(&data));
        }
    }

    #[tokio::test]
    async fn known_md5_vector() {
        let file = UploadFile::from_bytes("hello.txt", b"hello world".to_vec());
        let chunks = create_chunks(file.len(), 4).unwrap();
        let hash = finish(FileHasher::spawn(&file, chunks, HashAlgorithm::Md5), &mut Vec::new())
            .await
            .unwrap();
        assert_eq!(hash, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn hash_is_deterministic() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let file = UploadFile::from_bytes("d.bin", data);

        let mut hashes = Vec::new();
        for _ in 0..3 {
            let chunks = create_chunks(file.len(), 512).unwrap();
            let hash = finish(FileHasher::spawn(&file, chunks, HashAlgorithm::Md5), &mut Vec::new())
                .await
                .unwrap();
            hashes.push(hash);
        }
        assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn progress_per_chunk_then_single_done() {
        let file = UploadFile::from_bytes("f.bin", vec![7u8; 40]);
        let chunks = create_chunks(file.len(), 10).unwrap();
        let messages = collect(FileHasher::spawn(&file, chunks, HashAlgorithm::Md5)).await;

        assert_eq!(messages.len(), 5);
        let percents: Vec<(usize, f64)> = messages[..4]
            .iter()
            .map(|m| match m {
                HashMessage::Progress { index, percent } => (*index, *percent),
                other => panic!("expected progress, got {other:?}"),
            })
            .collect();
        assert_eq!(percents, vec![(0, 25.0), (1, 50.0), (2, 75.0), (3, 100.0)]);
        assert!(matches!(messages[4], HashMessage::Done { .. }));
    }

    #[tokio::test]
    async fn empty_file_hashes_empty_input() {
        let file = UploadFile::from_bytes("empty", Vec::new());
        let messages = collect(FileHasher::spawn(&file, Vec::new(), HashAlgorithm::Md5)).await;
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            HashMessage::Done { file_hash } => {
                assert_eq!(file_hash, &HashAlgorithm::Md5.digest(b""));
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    /// Source whose second chunk cannot be read.
    struct FailingSource;

    impl ChunkSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        fn len(&self) -> u64 {
            30
        }

        fn read_range(&self, offset: u64, len: usize) -> Result<Bytes, TransferError> {
            if offset == 10 {
                Err(TransferError::Io(std::io::Error::other("disk on fire")))
            } else {
                Ok(Bytes::from(vec![0u8; len]))
            }
        }
    }

    #[tokio::test]
    async fn read_failure_is_single_terminal_error() {
        let file = UploadFile::new(Arc::new(FailingSource));
        let chunks = create_chunks(file.len(), 10).unwrap();
        let messages = collect(FileHasher::spawn(&file, chunks, HashAlgorithm::Md5)).await;

        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], HashMessage::Progress { index: 0, .. }));
        assert!(matches!(
            messages[1],
            HashMessage::Failed {
                index: 1,
                error: TransferError::Io(_)
            }
        ));
    }

    #[tokio::test]
    async fn finish_surfaces_read_failure() {
        let file = UploadFile::new(Arc::new(FailingSource));
        let chunks = create_chunks(file.len(), 10).unwrap();
        let mut seen = Vec::new();
        let result = finish(
            FileHasher::spawn(&file, chunks, HashAlgorithm::Sha256),
            &mut seen,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(seen, vec![0]);
    }
}
