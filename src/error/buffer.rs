/// The reasons a piece buffer layout may be rejected at construction.
///
/// These are the only errors in this crate that are fatal to the caller:
/// a torrent whose metainfo produces an invalid layout cannot be downloaded.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("download length, piece length and block length must be positive")]
    /// One of the sizes the layout is computed from is zero.
    InvalidLayout,
}

/// The reasons a block claim may be refused.
///
/// All of these are expected under contention and mean "pick another
/// block", they are never a fault of the buffer.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    #[error("block is already claimed by another session")]
    /// The block is not free. Another session holds an in-flight claim on
    /// it, or its payload has already been downloaded.
    AlreadyClaimed,

    #[error("piece or block index is out of range")]
    /// The piece or block index does not exist in this torrent's layout.
    OutOfRange,

    #[error("piece is not incomplete")]
    /// The piece is already complete or saved and offers nothing to claim.
    WrongPieceState,
}

/// The reasons a downloaded block payload may be refused.
///
/// Both indicate the peer sent malformed or late data. The owning session
/// should drop the payload and release its claim, not tear down the buffer.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FillError {
    #[error("block payload is {got} bytes but the block is {expected} bytes")]
    /// The payload length does not equal the block's length in the layout.
    LengthMismatch { expected: u32, got: usize },

    #[error("claim is stale")]
    /// The block no longer belongs to this claim. The claim was released
    /// (peer disconnect or timeout) and the block possibly re-claimed by
    /// another session in the meantime.
    StaleClaim,
}
