use std::io::{self, Cursor};

use bytes::{Buf, BufMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{PeerId, Sha1Hash};

pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The preamble length on the wire: the protocol string length prefix, the
/// protocol string itself, the reserved field and the info hash.
const PREAMBLE_LEN: usize = 1 + 19 + 8 + 20;

/// The fixed-format preamble sent at the beginning of a peer session by
/// both sides of the connection.
///
/// preamble data format:
///
/// ```txt
/// <Protocol Identify length><Protocol Identify><Reserved><Info_hash>
///
/// |       ---- 1 byte ----  |-----19 bytes----|-8 bytes-|-20 bytes-|
/// ```
///
/// The peer id is a logically separate 20 byte field: peers may send it in
/// the same flight as the preamble or in a later one, so the codec frames
/// it separately (see [`HandshakeFrame`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Preamble {
    /// A reserved field, sent as all zero. This is where a client's
    /// supported extensions are announced; we ignore it rather than reject
    /// it, for forward compatibility.
    pub reserved: [u8; 8],
    /// The torrent's SHA1 info hash, used to identify the torrent in the
    /// handshake and to verify the peer.
    pub info_hash: Sha1Hash,
}

impl Preamble {
    pub fn new(info_hash: Sha1Hash) -> Self {
        Preamble {
            reserved: [0; 8],
            info_hash,
        }
    }
}

/// One frame of the handshake exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeFrame {
    Preamble(Preamble),
    PeerId(PeerId),
}

/// Encodes and decodes the two handshake frames.
///
/// The decoder is stateful: it first consumes exactly the 48 preamble
/// bytes, then exactly the 20 peer id bytes, buffering partial reads in
/// between. Whatever arrived beyond the preamble in one read simply stays
/// in the buffer for the peer id frame.
#[derive(Debug, Default)]
pub struct HandshakeCodec {
    phase: Phase,
}

#[derive(Debug, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Preamble,
    PeerId,
}

impl Encoder<HandshakeFrame> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        frame: HandshakeFrame,
        buf: &mut bytes::BytesMut,
    ) -> io::Result<()> {
        match frame {
            HandshakeFrame::Preamble(Preamble {
                reserved,
                info_hash,
            }) => {
                let prot = PROTOCOL_STRING.as_bytes();
                // protocol length prefix
                debug_assert_eq!(prot.len(), 19);
                buf.put_u8(prot.len() as u8);

                // payload
                buf.extend_from_slice(prot);
                buf.extend_from_slice(&reserved);
                buf.extend_from_slice(&info_hash);
            }
            HandshakeFrame::PeerId(peer_id) => {
                buf.extend_from_slice(&peer_id);
            }
        }
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = HandshakeFrame;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut bytes::BytesMut,
    ) -> io::Result<Option<HandshakeFrame>> {
        match self.phase {
            Phase::Preamble => {
                if buf.is_empty() {
                    return Ok(None);
                }

                // `get_*` integer extractors consume the message bytes by
                // advancing buf's internal cursor. However, we don't want to
                // do this as at this point we aren't sure we have the full
                // message in the buffer, and thus we just want to peek at
                // this value.
                let mut tmp_buf = Cursor::new(&buf);
                let prot_len = tmp_buf.get_u8() as usize;
                if prot_len != PROTOCOL_STRING.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        r#"Handshake must begin with the string "BitTorrent protocol"."#,
                    ));
                }

                // wait until the full preamble is in the buffer, then
                // consume exactly its 48 bytes, leaving any peer id bytes
                // that arrived in the same flight untouched
                if buf.remaining() < PREAMBLE_LEN {
                    return Ok(None);
                }
                buf.advance(1);

                // protocol string
                let mut prot = [0; 19];
                buf.copy_to_slice(&mut prot);
                if prot != *PROTOCOL_STRING.as_bytes() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        r#"Handshake must begin with the string "BitTorrent protocol"."#,
                    ));
                }
                // reserved field, ignored on receipt
                let mut reserved = [0; 8];
                buf.copy_to_slice(&mut reserved);
                // info hash
                let mut info_hash = [0; 20];
                buf.copy_to_slice(&mut info_hash);

                self.phase = Phase::PeerId;
                Ok(Some(HandshakeFrame::Preamble(Preamble {
                    reserved,
                    info_hash,
                })))
            }
            Phase::PeerId => {
                if buf.remaining() < 20 {
                    return Ok(None);
                }
                let mut peer_id = [0; 20];
                buf.copy_to_slice(&mut peer_id);
                Ok(Some(HandshakeFrame::PeerId(peer_id)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    use super::*;

    const INFO_HASH: Sha1Hash = [0x42; 20];
    const PEER_ID: PeerId = [0x1d; 20];

    #[test]
    fn encodes_the_fixed_preamble_format() {
        let mut buf = BytesMut::new();
        let mut codec = HandshakeCodec::default();
        codec
            .encode(HandshakeFrame::Preamble(Preamble::new(INFO_HASH)), &mut buf)
            .unwrap();

        assert_eq!(buf.len(), 48);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL_STRING.as_bytes());
        assert_eq!(&buf[20..28], &[0; 8]);
        assert_eq!(&buf[28..48], &INFO_HASH);

        codec
            .encode(HandshakeFrame::PeerId(PEER_ID), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), 68);
        assert_eq!(&buf[48..], &PEER_ID);
    }

    #[test]
    fn decodes_both_frames_from_a_single_flight() {
        let mut buf = BytesMut::new();
        let mut encoder = HandshakeCodec::default();
        encoder
            .encode(HandshakeFrame::Preamble(Preamble::new(INFO_HASH)), &mut buf)
            .unwrap();
        encoder
            .encode(HandshakeFrame::PeerId(PEER_ID), &mut buf)
            .unwrap();

        let mut decoder = HandshakeCodec::default();
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(HandshakeFrame::Preamble(Preamble::new(INFO_HASH)))
        );
        // the peer id arrived in the same flight and was left in the buffer
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(HandshakeFrame::PeerId(PEER_ID))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn buffers_partial_reads() {
        let mut wire = BytesMut::new();
        let mut encoder = HandshakeCodec::default();
        encoder
            .encode(HandshakeFrame::Preamble(Preamble::new(INFO_HASH)), &mut wire)
            .unwrap();
        encoder
            .encode(HandshakeFrame::PeerId(PEER_ID), &mut wire)
            .unwrap();

        let mut decoder = HandshakeCodec::default();
        let mut buf = BytesMut::new();

        // drip the 68 bytes in over several reads
        let mut frames = Vec::new();
        for chunk in wire.chunks(13) {
            buf.extend_from_slice(chunk);
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(
            frames,
            vec![
                HandshakeFrame::Preamble(Preamble::new(INFO_HASH)),
                HandshakeFrame::PeerId(PEER_ID),
            ]
        );
    }

    #[test]
    fn rejects_a_malformed_protocol_prefix() {
        let mut buf = BytesMut::from(&[42u8; 68][..]);
        let mut decoder = HandshakeCodec::default();
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn ignores_nonzero_reserved_bits() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[19]);
        buf.extend_from_slice(PROTOCOL_STRING.as_bytes());
        buf.extend_from_slice(&[0xff; 8]);
        buf.extend_from_slice(&INFO_HASH);

        let mut decoder = HandshakeCodec::default();
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            HandshakeFrame::Preamble(Preamble {
                reserved: [0xff; 8],
                info_hash: INFO_HASH,
            })
        );
    }
}
