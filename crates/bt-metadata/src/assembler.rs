use std::collections::VecDeque;

use bt_core::constants::CHUNK_SIZE;
use bt_core::torrent_metainfo::{TorrentMetaV1, TorrentMetaV1Info};
use bt_core::Id20;
use buffers::ByteBufOwned;
use sha1w::{ISha1, Sha1};
use tracing::warn;

use crate::wire::expected_piece_length;

/// Minimum time between re-requesting the same outstanding piece.
const MIN_REPEAT_INTERVAL_SECS: u64 = 3;

#[derive(Debug, Clone, Copy)]
struct MetadataNode {
    piece_index: u32,
    requested_at: u64,
}

/// Outcome of a completed [`MetadataAssembler::idle_tick`].
pub enum IdleTickOutcome {
    /// Still waiting on more pieces, or nothing to do.
    Pending,
    /// Assembly finished: the caller should install this metainfo and tear the
    /// assembler down.
    Complete(TorrentMetaV1<ByteBufOwned>),
    /// Validation failed (hash mismatch or malformed bencode); every piece must be
    /// redownloaded.
    Redownload,
}

/// Incrementally reconstructs a torrent's info dictionary from untrusted,
/// peer-supplied `ut_metadata` fragments.
pub struct MetadataAssembler {
    info_hash: Id20,
    total_size: u32,
    piece_count: u32,
    buffer: Vec<u8>,
    pieces_needed: VecDeque<MetadataNode>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("metadata size must be in (0, i32::MAX], got {0}")]
    InvalidSize(u32),
}

fn div_ceil(a: u32, b: u32) -> u32 {
    a.div_ceil(b)
}

impl MetadataAssembler {
    /// Begin acquiring metadata of `total_size` bytes for `info_hash`. Rejects sizes
    /// outside `(0, i32::MAX]`; the caller is responsible for rejecting a second
    /// assembler for a torrent that already has one, or one for a torrent that
    /// already has metainfo.
    pub fn init(info_hash: Id20, total_size: u32) -> Result<Self, InitError> {
        if total_size == 0 || total_size > i32::MAX as u32 {
            return Err(InitError::InvalidSize(total_size));
        }

        let piece_count = div_ceil(total_size, CHUNK_SIZE);
        let pieces_needed = (0..piece_count)
            .map(|piece_index| MetadataNode {
                piece_index,
                requested_at: 0,
            })
            .collect();

        Ok(Self {
            info_hash,
            total_size,
            piece_count,
            buffer: vec![0u8; total_size as usize],
            pieces_needed,
        })
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    fn reset_pieces_needed(&mut self) {
        self.pieces_needed = (0..self.piece_count)
            .map(|piece_index| MetadataNode {
                piece_index,
                requested_at: 0,
            })
            .collect();
    }

    /// Accept a fragment for `index`. Silently ignored (never an error surfaced to the
    /// untrusted peer) if out of range, the wrong length, or already received.
    pub fn accept_piece(&mut self, index: u32, data: &[u8]) {
        if index >= self.piece_count {
            return;
        }
        if data.len() as u32 != expected_piece_length(index, self.total_size) {
            return;
        }
        let Some(pos) = self
            .pieces_needed
            .iter()
            .position(|n| n.piece_index == index)
        else {
            return;
        };

        let start = (index * CHUNK_SIZE) as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.pieces_needed.remove(pos);
    }

    /// Pick the next piece to (re)request, rotating the FIFO so no piece is asked for
    /// twice within [`MIN_REPEAT_INTERVAL_SECS`].
    pub fn next_request(&mut self, now: u64) -> Option<u32> {
        let head = *self.pieces_needed.front()?;
        if head.requested_at + MIN_REPEAT_INTERVAL_SECS >= now {
            return None;
        }

        let mut node = self.pieces_needed.pop_front().unwrap();
        node.requested_at = now;
        self.pieces_needed.push_back(node);
        Some(node.piece_index)
    }

    /// Fraction of pieces received, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.piece_count == 0 {
            return 0.0;
        }
        (self.piece_count - self.pieces_needed.len() as u32) as f64 / self.piece_count as f64
    }

    /// If all pieces are in hand, validate and synthesize the full metainfo. On any
    /// validation failure, every piece is marked for redownload and no metainfo is
    /// installed.
    pub fn idle_tick(&mut self, base: &TorrentMetaV1<ByteBufOwned>) -> IdleTickOutcome {
        if !self.pieces_needed.is_empty() {
            return IdleTickOutcome::Pending;
        }

        let mut hasher = Sha1::new();
        hasher.update(&self.buffer);
        let digest = hasher.finish();
        if digest != self.info_hash.0 {
            warn!(info_hash = %self.info_hash.as_string(), "metadata hash mismatch, redownloading");
            self.reset_pieces_needed();
            return IdleTickOutcome::Redownload;
        }

        let info: TorrentMetaV1Info<ByteBufOwned> = {
            let mut de = bencode::BencodeDeserializer::new_from_buf(&self.buffer);
            match serde::Deserialize::deserialize(&mut de) {
                Ok(info) => info,
                Err(e) => {
                    warn!(error = %e, "metadata did not parse as a bencoded info dict, redownloading");
                    self.reset_pieces_needed();
                    return IdleTickOutcome::Redownload;
                }
            }
        };

        let synthesized = TorrentMetaV1 {
            announce: base.announce.clone(),
            announce_list: base.announce_list.clone(),
            info,
            comment: base.comment.clone(),
            created_by: base.created_by.clone(),
            encoding: base.encoding.clone(),
            publisher: base.publisher.clone(),
            publisher_url: base.publisher_url.clone(),
            creation_date: base.creation_date,
            source: base.source.clone(),
            url_list: base.url_list.clone(),
            info_hash: self.info_hash,
        };

        // re-parse to confirm the synthesized document is itself well-formed
        let mut reencoded = Vec::new();
        if bencode::bencode_serialize_to_writer(&synthesized, &mut reencoded).is_err() {
            warn!("failed to re-serialize synthesized metainfo, redownloading");
            self.reset_pieces_needed();
            return IdleTickOutcome::Redownload;
        }
        if bt_core::torrent_metainfo::torrent_from_bytes::<ByteBufOwned>(&reencoded).is_err() {
            warn!("synthesized metainfo failed to re-parse, redownloading");
            self.reset_pieces_needed();
            return IdleTickOutcome::Redownload;
        }

        IdleTickOutcome::Complete(synthesized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_base(info_hash: Id20) -> TorrentMetaV1<ByteBufOwned> {
        TorrentMetaV1 {
            announce: None,
            announce_list: vec![],
            info: TorrentMetaV1Info {
                name: None,
                pieces: ByteBufOwned::from(Vec::new()),
                piece_length: 16384,
                length: None,
                md5sum: None,
                files: None,
            },
            comment: None,
            created_by: None,
            encoding: None,
            publisher: None,
            publisher_url: None,
            creation_date: None,
            source: None,
            url_list: vec![],
            info_hash,
        }
    }

    fn encoded_info() -> Vec<u8> {
        let info = TorrentMetaV1Info {
            name: Some(ByteBufOwned::from(b"a.bin".to_vec())),
            pieces: ByteBufOwned::from(vec![1u8; 20]),
            piece_length: 16384,
            length: Some(5),
            md5sum: None,
            files: None,
        };
        let mut buf = Vec::new();
        bencode::bencode_serialize_to_writer(&info, &mut buf).unwrap();
        buf
    }

    fn hash_of(buf: &[u8]) -> Id20 {
        let mut h = Sha1::new();
        h.update(buf);
        Id20::new(h.finish())
    }

    #[test]
    fn completes_when_all_pieces_delivered_correctly() {
        let info_bytes = encoded_info();
        let info_hash = hash_of(&info_bytes);
        let mut assembler = MetadataAssembler::init(info_hash, info_bytes.len() as u32).unwrap();
        assembler.accept_piece(0, &info_bytes);
        assert!(assembler.pieces_needed.is_empty());

        match assembler.idle_tick(&blank_base(info_hash)) {
            IdleTickOutcome::Complete(meta) => {
                assert_eq!(meta.info.length, Some(5));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn redownloads_on_hash_mismatch() {
        let info_hash = Id20::new([0xAA; 20]);
        let total = (CHUNK_SIZE * 2) as u32;
        let mut assembler = MetadataAssembler::init(info_hash, total).unwrap();
        assembler.accept_piece(0, &vec![1u8; CHUNK_SIZE as usize]);
        assembler.accept_piece(1, &vec![2u8; CHUNK_SIZE as usize]);
        assert!(assembler.pieces_needed.is_empty());

        match assembler.idle_tick(&blank_base(info_hash)) {
            IdleTickOutcome::Redownload => {}
            other => panic!("expected Redownload, got {other:?}"),
        }
        assert_eq!(assembler.pieces_needed.len(), 2);
    }

    #[test]
    fn redelivering_an_accepted_piece_is_a_noop() {
        let mut assembler = MetadataAssembler::init(Id20::new([1; 20]), CHUNK_SIZE).unwrap();
        assembler.accept_piece(0, &vec![5u8; CHUNK_SIZE as usize]);
        assert!(assembler.pieces_needed.is_empty());
        assembler.accept_piece(0, &vec![9u8; CHUNK_SIZE as usize]);
        // second delivery must not have overwritten the buffer
        assert!(assembler.buffer.iter().all(|&b| b == 5));
    }

    #[test]
    fn next_request_respects_min_repeat_interval() {
        let mut assembler = MetadataAssembler::init(Id20::new([1; 20]), CHUNK_SIZE * 2).unwrap();
        assert_eq!(assembler.next_request(4), Some(0));
        assert_eq!(assembler.next_request(5), Some(1));
        // re-requested too soon
        assert_eq!(assembler.next_request(6), None);
        assert_eq!(assembler.next_request(8), Some(0));
    }
}

impl std::fmt::Debug for IdleTickOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdleTickOutcome::Pending => write!(f, "Pending"),
            IdleTickOutcome::Complete(_) => write!(f, "Complete"),
            IdleTickOutcome::Redownload => write!(f, "Redownload"),
        }
    }
}
