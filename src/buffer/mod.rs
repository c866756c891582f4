use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use sha1::{Digest, Sha1};

use crate::{
    error::buffer::{ClaimError, FillError, LayoutError},
    layout::Layout,
    BlockIndex, PieceIndex, Sha1Hash,
};

/// The expected integrity digests of a torrent, one per piece, together
/// with the nominal piece length.
///
/// Loaded from the torrent's metainfo and immutable afterwards.
#[derive(Clone, Debug)]
pub struct ShaPieces {
    /// The nominal piece length. Every piece except possibly the last has
    /// this length.
    piece_len: u32,
    /// The pieces field of the metainfo is a concatenation of 20 byte
    /// SHA-1 hashes, one per piece, in piece order.
    hashes: Vec<Sha1Hash>,
}

impl ShaPieces {
    pub fn new(piece_len: u32, hashes: Vec<Sha1Hash>) -> Self {
        Self { piece_len, hashes }
    }

    pub fn piece_len(&self) -> u32 {
        self.piece_len
    }

    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    /// Returns the expected digest of the piece at the index.
    pub fn expected(&self, index: PieceIndex) -> Option<&Sha1Hash> {
        self.hashes.get(index)
    }
}

/// The digest function used by real downloads. Tests may hand
/// [`PieceBuffer::verify_piece`] an arbitrary function instead.
pub fn sha1_digest(bytes: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// One block of a piece, the granularity at which peers deliver data.
enum Block {
    /// Unclaimed, available for a session to request from its peer.
    Free,
    /// Claimed by exactly one in-flight download. The claim id ties the
    /// block to the [`BlockClaim`] that was handed out for it.
    Tagged { claim_id: u64 },
    /// Downloaded payload, held until the whole piece completes.
    Full { bytes: Vec<u8> },
}

/// One piece of the torrent.
///
/// The only legal transition order is incomplete to complete to saved,
/// with a single back edge: a piece whose hash verification fails reverts
/// to incomplete with every block free again.
enum Piece {
    /// Not all data is present yet.
    Incomplete { blocks: Vec<Block> },
    /// All blocks arrived and were concatenated, but the payload has not
    /// been hash-verified yet.
    ///
    /// Shared ownership so that the payload handed to the caller on
    /// completion and the copy awaiting verification are the same
    /// allocation.
    Complete { bytes: Arc<Vec<u8>> },
    /// Verified and durably written. The payload is no longer held in
    /// memory.
    Saved,
}

/// Exclusive, revocable ownership of one free block by one in-flight
/// download.
///
/// The claim id makes the token single-use across releases: once the
/// claim is released, a fill with the old token is refused even if the
/// block has been re-claimed by another session in the meantime.
#[derive(Debug, PartialEq, Eq)]
pub struct BlockClaim {
    piece: PieceIndex,
    block: BlockIndex,
    claim_id: u64,
}

impl BlockClaim {
    pub fn piece(&self) -> PieceIndex {
        self.piece
    }

    pub fn block(&self) -> BlockIndex {
        self.block
    }
}

/// The payload of a freshly completed piece, still unverified.
#[derive(Debug)]
pub struct CompletedPiece {
    pub index: PieceIndex,
    pub bytes: Arc<Vec<u8>>,
}

/// The result of hash-checking a complete piece.
#[derive(Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The piece matched its expected digest and is now saved.
    Verified,
    /// The piece did not match. Its data was discarded and every block is
    /// free again, the piece must be re-downloaded from scratch. This is a
    /// recoverable event, not a fault.
    Corrupt,
}

/// A read-only snapshot of one piece, for scheduling decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceStateSnapshot {
    Incomplete { blocks: Vec<BlockState> },
    Complete,
    Saved,
}

/// The observable state of one block in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Tagged,
    Full,
}

/// The download progress of an entire torrent.
///
/// This is the single source of truth for "what do we have". It is shared
/// by every peer session of the torrent and all of its operations are safe
/// to call concurrently. Sessions never hold piece or block state of their
/// own, they only hold [`BlockClaim`] tokens.
///
/// Each piece sits behind its own lock, so claim contention stays local:
/// sessions working on different pieces never touch the same lock, and the
/// critical sections are a few state-tag updates.
pub struct PieceBuffer {
    layout: Layout,
    sha_pieces: ShaPieces,
    pieces: Vec<Mutex<Piece>>,
    /// The source of claim ids. Never reused within one buffer.
    next_claim_id: AtomicU64,
}

impl PieceBuffer {
    /// Lays out the buffer for a torrent of the given length. Every piece
    /// starts incomplete with every block free.
    ///
    /// Fails if any of the sizes is zero or if the number of expected
    /// digests does not match the number of pieces the length implies.
    pub fn new(
        total_len: u64,
        sha_pieces: ShaPieces,
        block_len: u32,
    ) -> Result<Self, LayoutError> {
        let layout = Layout::new(total_len, sha_pieces.piece_len(), block_len)?;
        if sha_pieces.piece_count() != layout.piece_count() {
            return Err(LayoutError::InvalidLayout);
        }

        let pieces = (0..layout.piece_count())
            .map(|piece| {
                let blocks =
                    (0..layout.block_count(piece)).map(|_| Block::Free).collect();
                Mutex::new(Piece::Incomplete { blocks })
            })
            .collect();

        Ok(Self {
            layout,
            sha_pieces,
            pieces,
            next_claim_id: AtomicU64::new(0),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Atomically claims a free block for one in-flight download.
    ///
    /// At most one session can hold a claim on a block: concurrent claims
    /// against the same free block yield exactly one token and leave
    /// everyone else with [`ClaimError::AlreadyClaimed`]. All claim errors
    /// mean "pick another block".
    pub fn claim_block(
        &self,
        piece: PieceIndex,
        block: BlockIndex,
    ) -> Result<BlockClaim, ClaimError> {
        if !self.layout.contains(piece, block) {
            return Err(ClaimError::OutOfRange);
        }

        let mut guard = self.pieces[piece].lock().unwrap();
        match &mut *guard {
            Piece::Incomplete { blocks } => match blocks[block] {
                Block::Free => {
                    let claim_id =
                        self.next_claim_id.fetch_add(1, Ordering::Relaxed);
                    blocks[block] = Block::Tagged { claim_id };
                    Ok(BlockClaim {
                        piece,
                        block,
                        claim_id,
                    })
                }
                _ => Err(ClaimError::AlreadyClaimed),
            },
            // complete and saved pieces offer nothing to claim
            _ => Err(ClaimError::WrongPieceState),
        }
    }

    /// Stores a downloaded block payload under an existing claim.
    ///
    /// Only the session holding the live claim can fill the block: if the
    /// claim was released in the meantime the payload is refused with
    /// [`FillError::StaleClaim`], even if the block has since been
    /// re-claimed. This is what prevents a lost update when a release
    /// races with an in-flight download.
    pub fn fill_block(
        &self,
        claim: &BlockClaim,
        bytes: Vec<u8>,
    ) -> Result<(), FillError> {
        let expected = self.layout.block_len(claim.piece, claim.block);
        if bytes.len() != expected as usize {
            return Err(FillError::LengthMismatch {
                expected,
                got: bytes.len(),
            });
        }

        let mut guard = self.pieces[claim.piece].lock().unwrap();
        match &mut *guard {
            Piece::Incomplete { blocks } => match blocks[claim.block] {
                Block::Tagged { claim_id } if claim_id == claim.claim_id => {
                    blocks[claim.block] = Block::Full { bytes };
                    Ok(())
                }
                _ => Err(FillError::StaleClaim),
            },
            _ => Err(FillError::StaleClaim),
        }
    }

    /// Releases a claim, making the block free to be claimed again.
    ///
    /// Invoked by the peer runtime when the session that claimed the block
    /// disconnects or times out. Releasing a claim that is no longer live
    /// is a no-op, so it is always safe to call on session teardown.
    pub fn release_block(&self, claim: &BlockClaim) {
        let mut guard = self.pieces[claim.piece].lock().unwrap();
        if let Piece::Incomplete { blocks } = &mut *guard {
            if let Block::Tagged { claim_id } = blocks[claim.block] {
                if claim_id == claim.claim_id {
                    blocks[claim.block] = Block::Free;
                }
            }
        }
    }

    /// If every block of the piece is full, concatenates them in index
    /// order, transitions the piece to complete and returns the payload.
    /// Returns `None` otherwise.
    ///
    /// The per-block buffers are consumed by the concatenation, after this
    /// returns the payload lives only in the complete piece.
    pub fn try_complete_piece(
        &self,
        piece: PieceIndex,
    ) -> Option<CompletedPiece> {
        if piece >= self.layout.piece_count() {
            return None;
        }

        let mut guard = self.pieces[piece].lock().unwrap();
        let blocks = match &mut *guard {
            Piece::Incomplete { blocks } => blocks,
            // completion is only meaningful once
            _ => return None,
        };
        if !blocks.iter().all(|b| matches!(b, Block::Full { .. })) {
            return None;
        }

        let mut bytes =
            Vec::with_capacity(self.layout.piece_len(piece) as usize);
        for block in std::mem::take(blocks) {
            match block {
                Block::Full { bytes: payload } => {
                    bytes.extend_from_slice(&payload)
                }
                _ => unreachable!("all blocks checked full above"),
            }
        }

        let bytes = Arc::new(bytes);
        *guard = Piece::Complete {
            bytes: Arc::clone(&bytes),
        };
        Some(CompletedPiece {
            index: piece,
            bytes,
        })
    }

    /// Hash-checks a complete piece against its expected digest.
    ///
    /// On a match the piece becomes saved and its payload is dropped. On a
    /// mismatch the piece reverts to incomplete with every block free, and
    /// must be re-downloaded from scratch; the outcome is still `Ok` since
    /// a corrupt piece is an expected event of an open network.
    ///
    /// Only complete pieces can be verified.
    pub fn verify_piece(
        &self,
        piece: PieceIndex,
        digest: impl Fn(&[u8]) -> Sha1Hash,
    ) -> Result<VerifyOutcome, ClaimError> {
        let expected = self
            .sha_pieces
            .expected(piece)
            .ok_or(ClaimError::OutOfRange)?;

        let mut guard = self.pieces[piece].lock().unwrap();
        let matches = match &*guard {
            Piece::Complete { bytes } => digest(bytes.as_slice()) == *expected,
            _ => return Err(ClaimError::WrongPieceState),
        };

        if matches {
            *guard = Piece::Saved;
            Ok(VerifyOutcome::Verified)
        } else {
            log::warn!("piece {} failed hash check, requeueing", piece);
            let blocks = (0..self.layout.block_count(piece))
                .map(|_| Block::Free)
                .collect();
            *guard = Piece::Incomplete { blocks };
            Ok(VerifyOutcome::Corrupt)
        }
    }

    /// Takes a read-only snapshot of one piece, for choosing what to
    /// request next. Returns `None` for an out of range index.
    pub fn piece_state(&self, piece: PieceIndex) -> Option<PieceStateSnapshot> {
        let guard = self.pieces.get(piece)?.lock().unwrap();
        Some(match &*guard {
            Piece::Incomplete { blocks } => PieceStateSnapshot::Incomplete {
                blocks: blocks
                    .iter()
                    .map(|b| match b {
                        Block::Free => BlockState::Free,
                        Block::Tagged { .. } => BlockState::Tagged,
                        Block::Full { .. } => BlockState::Full,
                    })
                    .collect(),
            },
            Piece::Complete { .. } => PieceStateSnapshot::Complete,
            Piece::Saved => PieceStateSnapshot::Saved,
        })
    }

    /// Returns the number of pieces that are verified and saved.
    pub fn saved_piece_count(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| matches!(&*p.lock().unwrap(), Piece::Saved))
            .count()
    }

    /// Returns true once every piece of the torrent is saved.
    pub fn is_seed(&self) -> bool {
        self.saved_piece_count() == self.layout.piece_count()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use pretty_assertions::assert_eq;

    use super::*;

    /// A 1000 byte torrent with 400 byte pieces and 150 byte blocks:
    /// pieces of 400, 400 and 200 bytes, with blocks (150, 150, 100),
    /// (150, 150, 100) and (150, 50).
    fn buffer_with_hashes(hashes: Vec<Sha1Hash>) -> PieceBuffer {
        PieceBuffer::new(1000, ShaPieces::new(400, hashes), 150).unwrap()
    }

    fn buffer() -> PieceBuffer {
        buffer_with_hashes(vec![[0; 20]; 3])
    }

    /// Claims and fills every block of a piece with a repeating marker
    /// byte, returning the expected concatenation.
    fn fill_piece(buf: &PieceBuffer, piece: PieceIndex, marker: u8) -> Vec<u8> {
        let mut expected = Vec::new();
        for block in 0..buf.layout().block_count(piece) {
            let len = buf.layout().block_len(piece, block) as usize;
            let payload = vec![marker, len as u8]
                .into_iter()
                .cycle()
                .take(len)
                .collect::<Vec<_>>();
            expected.extend_from_slice(&payload);

            let claim = buf.claim_block(piece, block).unwrap();
            buf.fill_block(&claim, payload).unwrap();
        }
        expected
    }

    #[test]
    fn rejects_digest_count_mismatch() {
        let res = PieceBuffer::new(1000, ShaPieces::new(400, vec![[0; 20]; 2]), 150);
        assert!(matches!(res, Err(LayoutError::InvalidLayout)));
    }

    #[test]
    fn fresh_buffer_is_all_free() {
        let buf = buffer();
        for piece in 0..3 {
            let blocks = match buf.piece_state(piece).unwrap() {
                PieceStateSnapshot::Incomplete { blocks } => blocks,
                state => panic!("fresh piece should be incomplete: {state:?}"),
            };
            assert_eq!(blocks.len(), buf.layout().block_count(piece));
            assert!(blocks.iter().all(|b| *b == BlockState::Free));
        }
        assert!(!buf.is_seed());
    }

    #[test]
    fn claim_is_exclusive() {
        let buf = buffer();
        let claim = buf.claim_block(0, 0).unwrap();
        assert_eq!(claim.piece(), 0);
        assert_eq!(claim.block(), 0);
        assert_eq!(buf.claim_block(0, 0), Err(ClaimError::AlreadyClaimed));
        // other blocks are unaffected
        buf.claim_block(0, 1).unwrap();
    }

    #[test]
    fn claim_checks_ranges() {
        let buf = buffer();
        assert_eq!(buf.claim_block(3, 0), Err(ClaimError::OutOfRange));
        assert_eq!(buf.claim_block(0, 3), Err(ClaimError::OutOfRange));
        assert_eq!(buf.claim_block(2, 2), Err(ClaimError::OutOfRange));
    }

    #[test]
    fn concurrent_claims_yield_one_winner() {
        let buf = Arc::new(buffer());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let buf = Arc::clone(&buf);
                thread::spawn(move || buf.claim_block(1, 0).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();

        assert_eq!(wins, 1);
    }

    #[test]
    fn release_is_idempotent_and_reopens_the_block() {
        let buf = buffer();
        let claim = buf.claim_block(0, 0).unwrap();
        buf.release_block(&claim);
        buf.release_block(&claim);

        // the block is claimable again and the stale token cannot touch it
        let second = buf.claim_block(0, 0).unwrap();
        assert_eq!(
            buf.fill_block(&claim, vec![0; 150]),
            Err(FillError::StaleClaim)
        );
        // the stale token must not revoke the live claim either
        buf.release_block(&claim);
        buf.fill_block(&second, vec![0; 150]).unwrap();
    }

    #[test]
    fn fill_checks_payload_length() {
        let buf = buffer();
        let claim = buf.claim_block(2, 1).unwrap();
        assert_eq!(
            buf.fill_block(&claim, vec![0; 150]),
            Err(FillError::LengthMismatch {
                expected: 50,
                got: 150
            })
        );
        buf.fill_block(&claim, vec![0; 50]).unwrap();
    }

    #[test]
    fn completes_piece_in_block_order() {
        let buf = buffer();

        // fill out of order to make sure concatenation is by index
        let c2 = buf.claim_block(0, 2).unwrap();
        buf.fill_block(&c2, vec![2; 100]).unwrap();
        assert!(buf.try_complete_piece(0).is_none());

        let c0 = buf.claim_block(0, 0).unwrap();
        buf.fill_block(&c0, vec![0; 150]).unwrap();
        let c1 = buf.claim_block(0, 1).unwrap();
        buf.fill_block(&c1, vec![1; 150]).unwrap();

        let completed = buf.try_complete_piece(0).unwrap();
        assert_eq!(completed.index, 0);
        let mut expected = vec![0; 150];
        expected.extend_from_slice(&[1; 150]);
        expected.extend_from_slice(&[2; 100]);
        assert_eq!(*completed.bytes, expected);

        // only meaningful once
        assert!(buf.try_complete_piece(0).is_none());
        assert_eq!(buf.piece_state(0), Some(PieceStateSnapshot::Complete));
        assert_eq!(buf.claim_block(0, 0), Err(ClaimError::WrongPieceState));
    }

    #[test]
    fn verified_piece_becomes_saved() {
        let payload_digest = {
            let probe = buffer();
            let bytes = fill_piece(&probe, 0, 7);
            sha1_digest(&bytes)
        };
        let buf =
            buffer_with_hashes(vec![payload_digest, [0; 20], [0; 20]]);

        fill_piece(&buf, 0, 7);
        buf.try_complete_piece(0).unwrap();
        assert_eq!(buf.verify_piece(0, sha1_digest), Ok(VerifyOutcome::Verified));
        assert_eq!(buf.piece_state(0), Some(PieceStateSnapshot::Saved));
        assert_eq!(buf.saved_piece_count(), 1);

        // saved pieces never transition backward
        assert_eq!(
            buf.verify_piece(0, sha1_digest),
            Err(ClaimError::WrongPieceState)
        );
        assert!(buf.try_complete_piece(0).is_none());
    }

    #[test]
    fn corrupt_piece_resets_and_can_be_redownloaded() {
        let good: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let buf = buffer_with_hashes(vec![
            [0; 20],
            [0; 20],
            sha1_digest(&good),
        ]);

        fill_piece(&buf, 2, 0xab);
        buf.try_complete_piece(2).unwrap();

        // a digest that never matches always yields corrupt
        assert_eq!(
            buf.verify_piece(2, |_| [0xff; 20]),
            Ok(VerifyOutcome::Corrupt)
        );
        let blocks = match buf.piece_state(2).unwrap() {
            PieceStateSnapshot::Incomplete { blocks } => blocks,
            state => panic!("corrupt piece should reset: {state:?}"),
        };
        assert!(blocks.iter().all(|b| *b == BlockState::Free));

        // the piece can be fully re-claimed, re-filled and verified
        let c0 = buf.claim_block(2, 0).unwrap();
        buf.fill_block(&c0, good[..150].to_vec()).unwrap();
        let c1 = buf.claim_block(2, 1).unwrap();
        buf.fill_block(&c1, good[150..].to_vec()).unwrap();
        assert_eq!(*buf.try_complete_piece(2).unwrap().bytes, good);
        assert_eq!(buf.verify_piece(2, sha1_digest), Ok(VerifyOutcome::Verified));
    }

    #[test]
    fn full_download_becomes_seed() {
        let probe = buffer();
        let digests: Vec<Sha1Hash> = (0..3)
            .map(|piece| {
                let bytes = fill_piece(&probe, piece, piece as u8);
                sha1_digest(&bytes)
            })
            .collect();

        let buf = buffer_with_hashes(digests);
        for piece in 0..3 {
            fill_piece(&buf, piece, piece as u8);
            buf.try_complete_piece(piece).unwrap();
            assert_eq!(
                buf.verify_piece(piece, sha1_digest),
                Ok(VerifyOutcome::Verified)
            );
        }
        assert!(buf.is_seed());
    }
}
