use crate::{error::buffer::LayoutError, BlockIndex, PieceIndex};

/// The piece and block geometry of a single torrent.
///
/// A torrent's content is split into fixed size pieces, and downloading
/// happens at the granularity of blocks, which are fixed size chunks of a
/// piece. Only the last piece, and the last block of a piece, may be
/// shorter than the nominal length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// The length of the whole download, in bytes.
    total_len: u64,
    /// The nominal piece length. Comes from the torrent's metainfo.
    piece_len: u32,
    /// The nominal block length. A client tunable, not part of the torrent
    /// format.
    block_len: u32,
}

impl Layout {
    /// Validates the sizes and creates the layout.
    ///
    /// All three lengths must be positive, anything else cannot describe
    /// a downloadable torrent and is rejected.
    pub fn new(
        total_len: u64,
        piece_len: u32,
        block_len: u32,
    ) -> Result<Self, LayoutError> {
        if total_len == 0 || piece_len == 0 || block_len == 0 {
            return Err(LayoutError::InvalidLayout);
        }
        Ok(Self {
            total_len,
            piece_len,
            block_len,
        })
    }

    /// Returns the length of the whole download, in bytes.
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        // all but the last piece have the nominal piece length, but the last
        // piece may be shorter so we need to account for this by rounding
        // up before dividing
        ((self.total_len + self.piece_len as u64 - 1) / self.piece_len as u64)
            as usize
    }

    /// Returns the length of the piece at the index.
    ///
    /// # Panics
    ///
    /// Panics if the piece index is out of range.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        assert!(index < self.piece_count());
        let piece_offset = index as u64 * self.piece_len as u64;
        std::cmp::min(self.total_len - piece_offset, self.piece_len as u64)
            as u32
    }

    /// Returns the number of blocks in the piece at the index.
    pub fn block_count(&self, piece: PieceIndex) -> usize {
        let piece_len = self.piece_len(piece) as usize;
        (piece_len + (self.block_len as usize - 1)) / self.block_len as usize
    }

    /// Returns the length of a block within its piece.
    ///
    /// If the piece is not a multiple of the nominal block length, the last
    /// block of the piece is shorter.
    ///
    /// # Panics
    ///
    /// Panics if the piece or block index is out of range.
    pub fn block_len(&self, piece: PieceIndex, block: BlockIndex) -> u32 {
        let piece_len = self.piece_len(piece);
        let block_offset = block as u64 * self.block_len as u64;
        assert!((piece_len as u64) > block_offset);
        std::cmp::min(piece_len as u64 - block_offset, self.block_len as u64)
            as u32
    }

    /// Returns true if the piece and block indices both exist in this
    /// layout.
    pub fn contains(&self, piece: PieceIndex, block: BlockIndex) -> bool {
        piece < self.piece_count() && block < self.block_count(piece)
    }
}
