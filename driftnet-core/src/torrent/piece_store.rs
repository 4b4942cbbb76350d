//! Local storage of verified pieces, per peer.
//!
//! The store is owned exclusively by its peer agent; other peers only ever
//! reach it through the request/response protocol. The critical invariant
//! lives here: `commit` recomputes the digest itself, so an unverified
//! piece can never be counted as held, re-shared, or announced.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::RwLock;

use super::{InfoHash, PieceIndex, TorrentDescriptor, TorrentError};

/// Per-peer record of which verified pieces are held, keyed by torrent.
pub struct LocalPieceStore {
    cache_dir: Option<PathBuf>,
    inner: RwLock<HashMap<InfoHash, HashMap<u32, Bytes>>>,
}

impl LocalPieceStore {
    /// Creates an in-memory store.
    pub fn new() -> Self {
        Self {
            cache_dir: None,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a store that additionally caches verified pieces to disk,
    /// under one directory per torrent.
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir: Some(cache_dir),
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Verifies `data` against the descriptor and stores it as held.
    ///
    /// # Errors
    ///
    /// - `TorrentError::VerificationFailure` - Digest mismatch; the store
    ///   is left unchanged
    /// - `TorrentError::Io` - Disk cache write failed
    pub async fn commit(
        &self,
        descriptor: &TorrentDescriptor,
        index: PieceIndex,
        data: Bytes,
    ) -> Result<(), TorrentError> {
        if !descriptor.verify_piece(index, &data) {
            return Err(TorrentError::VerificationFailure { index });
        }

        let info_hash = descriptor.info_hash();
        if let Some(dir) = self.piece_cache_dir(info_hash) {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join(format!("{index}.piece")), &data).await?;
        }

        self.inner
            .write()
            .entry(info_hash)
            .or_default()
            .insert(index.as_u32(), data);
        Ok(())
    }

    /// Splits a complete file's bytes into pieces and stores them all.
    ///
    /// Used when seeding: the local file is the source of truth, so every
    /// piece must match the descriptor.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidInput` - Byte length differs from descriptor
    /// - `TorrentError::VerificationFailure` - File does not match manifest
    pub async fn load_seed(
        &self,
        descriptor: &TorrentDescriptor,
        bytes: &[u8],
    ) -> Result<u32, TorrentError> {
        if bytes.len() as u64 != descriptor.file_size() {
            return Err(TorrentError::InvalidInput {
                reason: format!(
                    "seed data is {} bytes, descriptor says {}",
                    bytes.len(),
                    descriptor.file_size()
                ),
            });
        }

        for (i, chunk) in bytes.chunks(descriptor.piece_length() as usize).enumerate() {
            self.commit(
                descriptor,
                PieceIndex::new(i as u32),
                Bytes::copy_from_slice(chunk),
            )
            .await?;
        }
        Ok(descriptor.piece_count())
    }

    /// Reloads previously cached pieces from disk, re-verifying each one.
    ///
    /// Pieces that fail verification or cannot be read are skipped, so a
    /// damaged cache only costs re-downloads. Returns the indices restored.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - Cache directory listing failed
    pub async fn load_cached(
        &self,
        descriptor: &TorrentDescriptor,
    ) -> Result<BTreeSet<u32>, TorrentError> {
        let Some(dir) = self.piece_cache_dir(descriptor.info_hash()) else {
            return Ok(BTreeSet::new());
        };
        if !dir.is_dir() {
            return Ok(BTreeSet::new());
        }

        let mut restored = BTreeSet::new();
        for index in 0..descriptor.piece_count() {
            let piece = PieceIndex::new(index);
            let path = dir.join(format!("{piece}.piece"));
            let Ok(data) = tokio::fs::read(&path).await else {
                continue;
            };
            match self.commit(descriptor, piece, Bytes::from(data)).await {
                Ok(()) => {
                    restored.insert(index);
                }
                Err(e) => {
                    tracing::warn!("Discarding cached piece {piece}: {e}");
                }
            }
        }
        Ok(restored)
    }

    /// Returns the held piece indices for a torrent.
    pub fn held(&self, info_hash: InfoHash) -> BTreeSet<u32> {
        self.inner
            .read()
            .get(&info_hash)
            .map(|pieces| pieces.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the verified bytes for a held piece.
    pub fn piece(&self, info_hash: InfoHash, index: PieceIndex) -> Option<Bytes> {
        self.inner
            .read()
            .get(&info_hash)?
            .get(&index.as_u32())
            .cloned()
    }

    pub fn has_piece(&self, info_hash: InfoHash, index: PieceIndex) -> bool {
        self.inner
            .read()
            .get(&info_hash)
            .is_some_and(|pieces| pieces.contains_key(&index.as_u32()))
    }

    /// Drops all pieces for a torrent, e.g. when a session is abandoned.
    pub fn clear(&self, info_hash: InfoHash) {
        self.inner.write().remove(&info_hash);
    }

    /// Concatenates all pieces in index order into the complete file.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PieceUnavailable` - Some piece is not held
    pub fn assemble(&self, descriptor: &TorrentDescriptor) -> Result<Vec<u8>, TorrentError> {
        let inner = self.inner.read();
        let pieces = inner
            .get(&descriptor.info_hash())
            .ok_or(TorrentError::TorrentNotFound {
                info_hash: descriptor.info_hash(),
            })?;

        let mut out = Vec::with_capacity(descriptor.file_size() as usize);
        for index in 0..descriptor.piece_count() {
            let data = pieces.get(&index).ok_or(TorrentError::PieceUnavailable {
                index: PieceIndex::new(index),
            })?;
            out.extend_from_slice(data);
        }
        Ok(out)
    }

    /// Assembles the completed download and writes it to `path`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PieceUnavailable` - Download is incomplete
    /// - `TorrentError::Io` - Write failed
    pub async fn write_file(
        &self,
        descriptor: &TorrentDescriptor,
        path: &Path,
    ) -> Result<(), TorrentError> {
        let bytes = self.assemble(descriptor)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    fn piece_cache_dir(&self, info_hash: InfoHash) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(info_hash.to_string()))
    }
}

impl Default for LocalPieceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_descriptor() -> (TorrentDescriptor, Vec<u8>) {
        let data: Vec<u8> = (0u8..25).collect();
        let descriptor = TorrentDescriptor::from_bytes("demo.bin", &data, 10).unwrap();
        (descriptor, data)
    }

    #[tokio::test]
    async fn test_commit_rejects_unverified_bytes() {
        let (descriptor, data) = demo_descriptor();
        let store = LocalPieceStore::new();

        let result = store
            .commit(
                &descriptor,
                PieceIndex::new(0),
                Bytes::copy_from_slice(&data[10..20]), // wrong piece
            )
            .await;

        assert!(matches!(
            result,
            Err(TorrentError::VerificationFailure { .. })
        ));
        assert!(store.held(descriptor.info_hash()).is_empty());
    }

    #[tokio::test]
    async fn test_commit_and_held_bitset() {
        let (descriptor, data) = demo_descriptor();
        let store = LocalPieceStore::new();

        store
            .commit(&descriptor, PieceIndex::new(2), Bytes::copy_from_slice(&data[20..]))
            .await
            .unwrap();
        store
            .commit(&descriptor, PieceIndex::new(0), Bytes::copy_from_slice(&data[..10]))
            .await
            .unwrap();

        let held = store.held(descriptor.info_hash());
        assert_eq!(held.into_iter().collect::<Vec<_>>(), vec![0, 2]);
        assert!(store.has_piece(descriptor.info_hash(), PieceIndex::new(2)));
        assert!(!store.has_piece(descriptor.info_hash(), PieceIndex::new(1)));
    }

    #[tokio::test]
    async fn test_load_seed_then_assemble_round_trips() {
        let (descriptor, data) = demo_descriptor();
        let store = LocalPieceStore::new();

        let loaded = store.load_seed(&descriptor, &data).await.unwrap();
        assert_eq!(loaded, 3);

        let assembled = store.assemble(&descriptor).unwrap();
        assert_eq!(assembled, data);
    }

    #[tokio::test]
    async fn test_assemble_reports_missing_piece() {
        let (descriptor, data) = demo_descriptor();
        let store = LocalPieceStore::new();

        store
            .commit(&descriptor, PieceIndex::new(0), Bytes::copy_from_slice(&data[..10]))
            .await
            .unwrap();

        assert!(matches!(
            store.assemble(&descriptor),
            Err(TorrentError::PieceUnavailable { index }) if index.as_u32() == 1
        ));
    }

    #[tokio::test]
    async fn test_disk_cache_survives_store_restart() {
        let (descriptor, data) = demo_descriptor();
        let dir = tempfile::tempdir().unwrap();

        let store = LocalPieceStore::with_cache_dir(dir.path().to_path_buf());
        store.load_seed(&descriptor, &data).await.unwrap();
        drop(store);

        let reopened = LocalPieceStore::with_cache_dir(dir.path().to_path_buf());
        let restored = reopened.load_cached(&descriptor).await.unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(reopened.assemble(&descriptor).unwrap(), data);
    }

    #[tokio::test]
    async fn test_load_cached_skips_corrupted_pieces() {
        let (descriptor, data) = demo_descriptor();
        let dir = tempfile::tempdir().unwrap();

        let store = LocalPieceStore::with_cache_dir(dir.path().to_path_buf());
        store.load_seed(&descriptor, &data).await.unwrap();

        // Corrupt one cached piece on disk
        let piece_path = dir
            .path()
            .join(descriptor.info_hash().to_string())
            .join("1.piece");
        tokio::fs::write(&piece_path, b"corrupted").await.unwrap();

        let reopened = LocalPieceStore::with_cache_dir(dir.path().to_path_buf());
        let restored = reopened.load_cached(&descriptor).await.unwrap();
        assert_eq!(restored.into_iter().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[tokio::test]
    async fn test_clear_forgets_torrent() {
        let (descriptor, data) = demo_descriptor();
        let store = LocalPieceStore::new();
        store.load_seed(&descriptor, &data).await.unwrap();

        store.clear(descriptor.info_hash());
        assert!(store.held(descriptor.info_hash()).is_empty());
    }
}
