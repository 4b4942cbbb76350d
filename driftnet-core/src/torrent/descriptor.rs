//! Torrent descriptors: immutable piece-hash manifests for a single file.
//!
//! A descriptor is created once from a file's bytes, never mutated, and
//! referenced by every peer operating on that file. Its piece digests are
//! the basis for content addressing and cross-peer verification.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::{InfoHash, PieceIndex, TorrentError};

/// Immutable description of a file's pieces and their SHA-1 digests.
///
/// Invariant: `piece_hashes.len() == ceil(file_size / piece_length)` and
/// the last piece may be shorter than `piece_length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentDescriptor {
    file_name: String,
    file_size: u64,
    piece_length: u32,
    #[serde(with = "hex_digests")]
    piece_hashes: Vec<[u8; 20]>,
}

impl TorrentDescriptor {
    /// Creates a descriptor by splitting `bytes` into consecutive
    /// `piece_length`-sized chunks and hashing each one.
    ///
    /// Deterministic: identical input always yields an identical
    /// descriptor.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidInput` - Zero piece length or empty input
    pub fn from_bytes(
        file_name: impl Into<String>,
        bytes: &[u8],
        piece_length: u32,
    ) -> Result<Self, TorrentError> {
        if piece_length == 0 {
            return Err(TorrentError::InvalidInput {
                reason: "piece length must be positive".to_string(),
            });
        }
        if bytes.is_empty() {
            return Err(TorrentError::InvalidInput {
                reason: "cannot describe an empty file".to_string(),
            });
        }

        let piece_hashes = bytes
            .chunks(piece_length as usize)
            .map(hash_piece)
            .collect();

        Ok(Self {
            file_name: file_name.into(),
            file_size: bytes.len() as u64,
            piece_length,
            piece_hashes,
        })
    }

    /// Creates a descriptor by streaming a file in piece-sized reads.
    ///
    /// Produces the identical descriptor `from_bytes` would for the
    /// file's full contents, without holding the file in memory.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidInput` - Zero piece length or empty file
    /// - `TorrentError::Io` - File read error
    pub async fn from_file(path: &Path, piece_length: u32) -> Result<Self, TorrentError> {
        if piece_length == 0 {
            return Err(TorrentError::InvalidInput {
                reason: "piece length must be positive".to_string(),
            });
        }

        let mut file = File::open(path).await?;
        let file_size = file.metadata().await?.len();
        if file_size == 0 {
            return Err(TorrentError::InvalidInput {
                reason: format!("cannot describe empty file: {}", path.display()),
            });
        }

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TorrentError::InvalidInput {
                reason: format!("invalid file name: {}", path.display()),
            })?
            .to_string();

        let mut piece_hashes = Vec::new();
        let mut buffer = vec![0u8; piece_length as usize];
        let mut position = 0u64;

        while position < file_size {
            let remaining = file_size - position;
            let read_size = (remaining as usize).min(piece_length as usize);
            file.read_exact(&mut buffer[..read_size]).await?;
            piece_hashes.push(hash_piece(&buffer[..read_size]));
            position += read_size as u64;
        }

        Ok(Self {
            file_name,
            file_size,
            piece_length,
            piece_hashes,
        })
    }

    /// Recomputes the digest of `bytes` and compares it to the recorded
    /// digest for `index`.
    ///
    /// Returns `false` for out-of-range indices. Never errors on
    /// mismatch: a bad piece is an expected, recoverable condition.
    pub fn verify_piece(&self, index: PieceIndex, bytes: &[u8]) -> bool {
        let Some(expected) = self.piece_hashes.get(index.as_u32() as usize) else {
            return false;
        };
        hash_piece(bytes) == *expected
    }

    /// SHA-1 identity over the canonical descriptor encoding.
    pub fn info_hash(&self) -> InfoHash {
        let mut hasher = Sha1::new();
        hasher.update(self.file_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.file_size.to_be_bytes());
        hasher.update(self.piece_length.to_be_bytes());
        for hash in &self.piece_hashes {
            hasher.update(hash);
        }
        InfoHash::new(hasher.finalize().into())
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Size in bytes of the given piece; the final piece may be short.
    ///
    /// Returns 0 for out-of-range indices.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let idx = index.as_u32();
        let count = self.piece_count();
        if idx >= count {
            return 0;
        }
        if idx + 1 == count {
            let remainder = self.file_size % self.piece_length as u64;
            if remainder > 0 {
                return remainder as u32;
            }
        }
        self.piece_length
    }

    /// Writes the descriptor as a torrent file artifact.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - Write error
    pub async fn write_torrent_file(&self, path: &Path) -> Result<(), TorrentError> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| TorrentError::Protocol {
            message: format!("descriptor encoding failed: {e}"),
        })?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Reads a torrent file back into the identical descriptor.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - Read error
    /// - `TorrentError::InvalidInput` - Malformed or inconsistent artifact
    pub async fn read_torrent_file(path: &Path) -> Result<Self, TorrentError> {
        let bytes = tokio::fs::read(path).await?;
        let descriptor: Self =
            serde_json::from_slice(&bytes).map_err(|e| TorrentError::InvalidInput {
                reason: format!("malformed torrent file {}: {e}", path.display()),
            })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Checks the piece-count invariant on externally supplied data.
    fn validate(&self) -> Result<(), TorrentError> {
        if self.piece_length == 0 || self.file_size == 0 {
            return Err(TorrentError::InvalidInput {
                reason: "descriptor has zero piece length or file size".to_string(),
            });
        }
        let expected = self.file_size.div_ceil(self.piece_length as u64);
        if self.piece_hashes.len() as u64 != expected {
            return Err(TorrentError::InvalidInput {
                reason: format!(
                    "descriptor lists {} piece hashes, expected {expected}",
                    self.piece_hashes.len()
                ),
            });
        }
        Ok(())
    }
}

fn hash_piece(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Hex encoding for the ordered piece digest list in torrent files.
mod hex_digests {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        hashes: &[[u8; 20]],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(hashes.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<[u8; 20]>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|text| {
                let bytes = hex::decode(&text).map_err(D::Error::custom)?;
                bytes
                    .try_into()
                    .map_err(|_| D::Error::custom(format!("digest must be 20 bytes: {text}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use proptest::prelude::*;
    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_descriptor_splits_uneven_final_piece() {
        let descriptor = TorrentDescriptor::from_bytes("demo.bin", &[7u8; 25], 10).unwrap();

        assert_eq!(descriptor.piece_count(), 3);
        assert_eq!(descriptor.piece_size(PieceIndex::new(0)), 10);
        assert_eq!(descriptor.piece_size(PieceIndex::new(1)), 10);
        assert_eq!(descriptor.piece_size(PieceIndex::new(2)), 5);
        assert_eq!(descriptor.piece_size(PieceIndex::new(3)), 0);
    }

    #[test]
    fn test_descriptor_exact_multiple_has_full_final_piece() {
        let descriptor = TorrentDescriptor::from_bytes("demo.bin", &[7u8; 30], 10).unwrap();
        assert_eq!(descriptor.piece_count(), 3);
        assert_eq!(descriptor.piece_size(PieceIndex::new(2)), 10);
    }

    #[test]
    fn test_descriptor_rejects_invalid_input() {
        assert!(matches!(
            TorrentDescriptor::from_bytes("demo.bin", &[1u8; 10], 0),
            Err(TorrentError::InvalidInput { .. })
        ));
        assert!(matches!(
            TorrentDescriptor::from_bytes("demo.bin", &[], 10),
            Err(TorrentError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_creation_is_deterministic() {
        let data = b"identical bytes in, identical descriptor out";
        let a = TorrentDescriptor::from_bytes("a.bin", data, 8).unwrap();
        let b = TorrentDescriptor::from_bytes("a.bin", data, 8).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.info_hash(), b.info_hash());
    }

    #[test]
    fn test_verify_piece_accepts_original_and_rejects_corruption() {
        let data = b"piece verification test payload, three pieces long..";
        let descriptor = TorrentDescriptor::from_bytes("v.bin", data, 20).unwrap();

        assert!(descriptor.verify_piece(PieceIndex::new(0), &data[..20]));
        assert!(descriptor.verify_piece(PieceIndex::new(1), &data[20..40]));

        let mut corrupted = data[..20].to_vec();
        corrupted[3] ^= 0x01;
        assert!(!descriptor.verify_piece(PieceIndex::new(0), &corrupted));

        // Out-of-range index never verifies
        assert!(!descriptor.verify_piece(PieceIndex::new(99), &data[..20]));
    }

    #[tokio::test]
    async fn test_from_file_matches_from_bytes() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let data = vec![42u8; 1000];
        temp_file.write_all(&data).unwrap();

        let from_file = TorrentDescriptor::from_file(temp_file.path(), 256)
            .await
            .unwrap();
        let file_name = temp_file.path().file_name().unwrap().to_str().unwrap();
        let from_bytes = TorrentDescriptor::from_bytes(file_name, &data, 256).unwrap();

        assert_eq!(from_file, from_bytes);
    }

    #[tokio::test]
    async fn test_torrent_file_round_trips_exactly() {
        let descriptor =
            TorrentDescriptor::from_bytes("round.bin", b"round trip payload bytes", 7).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round.torrent");
        descriptor.write_torrent_file(&path).await.unwrap();

        let reparsed = TorrentDescriptor::read_torrent_file(&path).await.unwrap();
        assert_eq!(reparsed, descriptor);
        assert_eq!(reparsed.info_hash(), descriptor.info_hash());
    }

    #[tokio::test]
    async fn test_read_rejects_inconsistent_piece_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.torrent");
        // Claims 25 bytes at piece length 10 but lists a single digest
        let bad = serde_json::json!({
            "file_name": "bad.bin",
            "file_size": 25,
            "piece_length": 10,
            "piece_hashes": [hex::encode([0u8; 20])],
        });
        tokio::fs::write(&path, serde_json::to_vec(&bad).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            TorrentDescriptor::read_torrent_file(&path).await,
            Err(TorrentError::InvalidInput { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_descriptor_creation_deterministic(
            data in proptest::collection::vec(any::<u8>(), 1..512),
            piece_length in 1u32..64,
        ) {
            let a = TorrentDescriptor::from_bytes("p.bin", &data, piece_length).unwrap();
            let b = TorrentDescriptor::from_bytes("p.bin", &data, piece_length).unwrap();
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(
                a.piece_count() as u64,
                (data.len() as u64).div_ceil(piece_length as u64)
            );
        }

        #[test]
        fn prop_single_byte_corruption_flips_verification(
            data in proptest::collection::vec(any::<u8>(), 1..256),
            flip_at in any::<prop::sample::Index>(),
        ) {
            let descriptor = TorrentDescriptor::from_bytes("p.bin", &data, 32).unwrap();
            let index = flip_at.index(data.len());
            let piece = PieceIndex::new((index / 32) as u32);
            let start = (piece.as_u32() as usize) * 32;
            let end = (start + 32).min(data.len());

            prop_assert!(descriptor.verify_piece(piece, &data[start..end]));

            let mut corrupted = data[start..end].to_vec();
            corrupted[index - start] ^= 0x01;
            prop_assert!(!descriptor.verify_piece(piece, &corrupted));
        }
    }
}
