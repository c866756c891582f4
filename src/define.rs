/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The peer ID is an arbitrary 20 byte string.
///
/// [`Guidelines for choosing a peer ID`](http://bittorrent.org/beps/bep_0020.html).
pub type PeerId = [u8; 20];

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source code we use `usize` to be consistent with other index types.
pub type PieceIndex = usize;

/// The type of a block's index within its piece.
pub type BlockIndex = usize;

/// The canonical block length, 16 KiB.
///
/// The buffer accepts any positive block length, this is merely the widely
/// used and accepted default that peers request over the wire.
pub const BLOCK_LEN: u32 = 0x4000;
