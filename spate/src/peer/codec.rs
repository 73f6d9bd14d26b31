//! The encoding and decoding of the BitTorrent wire protocol: the fixed 68
//! byte handshake and the length prefixed peer messages.
//!
//! Handshake:
//! `<pstrlen=19><pstr="BitTorrent protocol"><reserved: 8 bytes><info hash: 20
//! bytes><peer id: 20 bytes>`. The reserved bytes are sent as zeroes and
//! ignored on receipt.
//!
//! All later traffic is `<len: 4 bytes big endian><payload: len bytes>`,
//! where a zero length frame is a keep alive and the first payload byte of
//! every other frame is the message id.

use std::{convert::TryFrom, io};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The protocol string of the BitTorrent v1 handshake. Anything else (e.g.
/// an encrypted handshake attempt) kills the connection.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The largest frame we are willing to receive. A sane peer never sends
/// anything close to this (the largest legitimate message is a block of 16
/// KiB plus its header); larger advertised lengths are treated as malicious
/// and must be rejected before any buffer space is reserved for them.
pub(crate) const MAX_FRAME_LEN: u32 = 0xff_ffff;

/// The handshake, the first message either side of a connection sends.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, which must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Reserved extension bits, all zero on send.
    pub reserved: [u8; 8],
    /// The SHA-1 hash of the torrent's info dict.
    pub info_hash: Sha1Hash,
    /// The peer's arbitrary id.
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// The codec used during connection establishment. Once the handshakes are
/// exchanged the connection is switched over to [`PeerCodec`], keeping the
/// read buffer (the peer may follow its handshake with messages
/// immediately).
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        buf.reserve(68);
        buf.put_u8(handshake.prot.len() as u8);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the protocol string is validated as soon as it has arrived: a peer
        // that is not speaking plaintext BitTorrent is cut off right away
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake protocol string length must be 19",
            ));
        }
        if buf.len() >= 20 && &buf[1..20] != PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake protocol string mismatch",
            ));
        }
        if buf.len() < 68 {
            return Ok(None);
        }

        let mut buf = buf.split_to(68);
        buf.advance(20);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a message, which is the first byte of a (non keep alive)
/// frame's payload.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(id: u8) -> io::Result<Self> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Block),
            8 => Ok(Cancel),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown message id",
            )),
        }
    }
}

/// A peer message.
///
/// The piece message is named block here: a piece in the protocol's message
/// vocabulary is a block of a piece in the rest of the engine's vocabulary.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// The message's id, or `None` for a keep alive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }

    /// The number of bytes the message occupies on the wire, including the
    /// length prefix. Used for the per peer traffic counters.
    pub fn frame_len(&self) -> u64 {
        let payload_len = match self {
            Self::KeepAlive => 0,
            Self::Choke
            | Self::Unchoke
            | Self::Interested
            | Self::NotInterested => 1,
            Self::Have { .. } => 1 + 4,
            Self::Bitfield(bitfield) => 1 + (bitfield.len() + 7) / 8,
            Self::Request(_) | Self::Cancel(_) => 1 + 12,
            Self::Block { data, .. } => 1 + 8 + data.len(),
        };
        4 + payload_len as u64
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                // the caller pads its bitfield to a full byte boundary
                debug_assert_eq!(bitfield.len() % 8, 0);
                let octets = bitfield.as_slice();
                buf.put_u32(1 + octets.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(octets);
            }
            Request(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 8 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut prefix = [0; 4];
        prefix.copy_from_slice(&buf[0..4]);
        let msg_len = u32::from_be_bytes(prefix);

        // reject oversized frames before reserving any space for them
        if msg_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame length exceeds the 16 MiB cap",
            ));
        }

        if buf.len() < 4 + msg_len as usize {
            buf.reserve(4 + msg_len as usize - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::try_from(buf.get_u8())?;
        let payload_len = msg_len as usize - 1;

        // every message id implies a payload length; a mismatch means the
        // peer is not framing correctly and cannot be trusted
        let valid_len = match id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => payload_len == 0,
            MessageId::Have => payload_len == 4,
            MessageId::Request | MessageId::Cancel => payload_len == 12,
            MessageId::Block => payload_len >= 8,
            MessageId::Bitfield => true,
        };
        if !valid_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame length doesn't match the message id",
            ));
        }

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: buf.get_u32() as PieceIndex,
            },
            MessageId::Bitfield => {
                let octets = buf.split_to(payload_len);
                Message::Bitfield(Bitfield::from_vec(octets.to_vec()))
            }
            MessageId::Request => Message::Request(BlockInfo {
                piece_index: buf.get_u32() as PieceIndex,
                offset: buf.get_u32(),
                len: buf.get_u32(),
            }),
            MessageId::Block => {
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let data = buf.split_to(payload_len - 8).to_vec();
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => Message::Cancel(BlockInfo {
                piece_index: buf.get_u32() as PieceIndex,
                offset: buf.get_u32(),
                len: buf.get_u32(),
            }),
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::BLOCK_LEN;

    fn encode_handshake(handshake: Handshake) -> BytesMut {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        buf
    }

    fn encode(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = Handshake::new([0xab; 20], *b"spt-0000000000000000");
        let mut wire = encode_handshake(handshake.clone());
        assert_eq!(wire.len(), 68);
        assert_eq!(wire[0], 19);
        assert_eq!(&wire[1..20], PROTOCOL_STRING.as_bytes());

        let decoded = HandshakeCodec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_handshake_is_buffered_until_complete() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let wire = encode_handshake(handshake.clone());

        let mut partial = BytesMut::from(&wire[..40]);
        assert_eq!(HandshakeCodec.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&wire[40..]);
        assert_eq!(
            HandshakeCodec.decode(&mut partial).unwrap(),
            Some(handshake)
        );
    }

    #[test]
    fn test_handshake_rejects_wrong_protocol() {
        // wrong protocol string length
        let mut wire = BytesMut::new();
        wire.put_u8(5);
        wire.put_slice(b"BitTo");
        assert!(HandshakeCodec.decode(&mut wire).is_err());

        // right length, wrong string; the rejection happens as soon as the
        // first 20 bytes have arrived
        let mut wire = BytesMut::new();
        wire.put_u8(19);
        wire.put_slice(b"BitTorrent protocoX");
        assert!(HandshakeCodec.decode(&mut wire).is_err());
    }

    fn roundtrip(msg: Message) {
        let mut wire = encode(msg.clone());
        let original_wire = wire.clone();
        let decoded = PeerCodec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(wire.is_empty());
        // decoding and re-encoding reproduces the frame byte for byte
        assert_eq!(encode(decoded), original_wire);
    }

    #[test]
    fn test_message_roundtrips() {
        roundtrip(Message::KeepAlive);
        roundtrip(Message::Choke);
        roundtrip(Message::Unchoke);
        roundtrip(Message::Interested);
        roundtrip(Message::NotInterested);
        roundtrip(Message::Have { piece_index: 42 });
        roundtrip(Message::Bitfield(Bitfield::from_vec(vec![0b1010_0001])));
        roundtrip(Message::Request(BlockInfo {
            piece_index: 1,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        }));
        roundtrip(Message::Block {
            piece_index: 3,
            offset: 2 * BLOCK_LEN,
            data: (0..=255).collect(),
        });
        roundtrip(Message::Cancel(BlockInfo {
            piece_index: 1,
            offset: BLOCK_LEN,
            len: 1234,
        }));
    }

    #[test]
    fn test_bitfield_wire_format() {
        // bit i of byte b represents piece 8 * b + (7 - i)
        let mut bitfield = Bitfield::repeat(false, 16);
        for &index in &[0, 3, 9] {
            bitfield.set(index, true);
        }
        let wire = encode(Message::Bitfield(bitfield.clone()));
        assert_eq!(
            &wire[..],
            &[0, 0, 0, 3, 5, 0b1001_0000, 0b0100_0000][..]
        );

        let mut wire = BytesMut::from(&wire[..]);
        match PeerCodec.decode(&mut wire).unwrap().unwrap() {
            Message::Bitfield(decoded) => {
                assert_eq!(decoded, bitfield);
            }
            msg => panic!("expected bitfield, got {:?}", msg),
        }
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        for &prefix in &[0x0100_0000u32, 0xffff_ffff] {
            let mut wire = BytesMut::new();
            wire.put_u32(prefix);
            wire.put_u8(MessageId::Block as u8);
            let before_cap = wire.capacity();
            assert!(PeerCodec.decode(&mut wire).is_err());
            // the advertised length must not have been reserved
            assert_eq!(wire.capacity(), before_cap);
        }
    }

    #[test]
    fn test_mismatched_length_is_rejected() {
        // a choke message with a 1 byte payload
        let mut wire = BytesMut::new();
        wire.put_u32(2);
        wire.put_u8(MessageId::Choke as u8);
        wire.put_u8(0);
        assert!(PeerCodec.decode(&mut wire).is_err());

        // a have message one byte short
        let mut wire = BytesMut::new();
        wire.put_u32(4);
        wire.put_u8(MessageId::Have as u8);
        wire.put_slice(&[0, 0, 0]);
        assert!(PeerCodec.decode(&mut wire).is_err());
    }

    #[test]
    fn test_unknown_message_id_is_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u32(1);
        wire.put_u8(9);
        assert!(PeerCodec.decode(&mut wire).is_err());
    }

    #[test]
    fn test_partial_frame_is_buffered() {
        let wire = encode(Message::Have { piece_index: 7 });
        let mut partial = BytesMut::from(&wire[..3]);
        assert_eq!(PeerCodec.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&wire[3..6]);
        assert_eq!(PeerCodec.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&wire[6..]);
        assert_eq!(
            PeerCodec.decode(&mut partial).unwrap(),
            Some(Message::Have { piece_index: 7 })
        );
    }
}
