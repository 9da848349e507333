//! Wire frames: 12-byte-header full frames and 4-byte-header mini-frames.

use crate::error::FrameError;
use crate::ie::IaxIeList;

const FULL_FRAME_HEADER_LEN: usize = 12;
const MINI_FRAME_HEADER_LEN: usize = 4;

/// The wire frame type byte (spec.md §6): which of the nine IAX2 frame
/// families a full frame belongs to. Recognized in full for every type this
/// crate decodes; `Video`/`Image`/`Html` are recognized-but-not-decoded
/// stubs per spec.md §1 ("video/image frames beyond stub recognition").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Dtmf,
    Voice,
    Video,
    Image,
    Noise,
    Iax,
    Html,
    Text,
    Control,
}

impl FrameType {
    fn to_wire(self) -> u8 {
        match self {
            FrameType::Dtmf => 1,
            FrameType::Voice => 2,
            FrameType::Video => 3,
            FrameType::Image => 4,
            FrameType::Noise => 5,
            FrameType::Iax => 6,
            FrameType::Html => 7,
            FrameType::Text => 8,
            FrameType::Control => 9,
        }
    }

    fn from_wire(byte: u8) -> Option<FrameType> {
        Some(match byte {
            1 => FrameType::Dtmf,
            2 => FrameType::Voice,
            3 => FrameType::Video,
            4 => FrameType::Image,
            5 => FrameType::Noise,
            6 => FrameType::Iax,
            7 => FrameType::Html,
            8 => FrameType::Text,
            9 => FrameType::Control,
            _ => return None,
        })
    }
}

/// The full-frame subclass, spanning both IAX-protocol control frames and
/// mid-call signaling. Voice/Dtmf/Text/Noise frames carry a payload instead
/// of an IE list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subclass {
    New,
    RegReq,
    RegRel,
    RegAck,
    RegRej,
    Poke,
    Pong,
    Ping,
    Ack,
    Hangup,
    Reject,
    Accept,
    AuthReq,
    AuthRep,
    Inval,
    Vnak,
    LagRq,
    LagRp,
    Busy,
    Answer,
    Ringing,
    Progressing,
    Quelch,
    Unquelch,
    NotImplemented,
    Voice,
    Dtmf,
    Text,
    Noise,
}

impl Subclass {
    /// Whether this subclass carries an [`IaxIeList`] payload rather than
    /// raw media/text bytes.
    pub fn carries_ies(self) -> bool {
        !matches!(self, Subclass::Voice | Subclass::Dtmf | Subclass::Text | Subclass::Noise)
    }

    /// The wire frame-type family this subclass belongs to.
    pub fn frame_type(self) -> FrameType {
        match self {
            Subclass::Busy | Subclass::Answer | Subclass::Ringing | Subclass::Progressing => {
                FrameType::Control
            }
            Subclass::Voice => FrameType::Voice,
            Subclass::Dtmf => FrameType::Dtmf,
            Subclass::Text => FrameType::Text,
            Subclass::Noise => FrameType::Noise,
            _ => FrameType::Iax,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            Subclass::New => 1,
            Subclass::RegReq => 2,
            Subclass::RegRel => 3,
            Subclass::RegAck => 4,
            Subclass::RegRej => 5,
            Subclass::Poke => 6,
            Subclass::Pong => 7,
            Subclass::Ping => 8,
            Subclass::Ack => 9,
            Subclass::Hangup => 10,
            Subclass::Reject => 11,
            Subclass::Accept => 12,
            Subclass::AuthReq => 13,
            Subclass::AuthRep => 14,
            Subclass::Inval => 15,
            Subclass::Vnak => 16,
            Subclass::LagRq => 17,
            Subclass::LagRp => 18,
            Subclass::Busy => 19,
            Subclass::Answer => 20,
            Subclass::Ringing => 21,
            Subclass::Progressing => 22,
            Subclass::Quelch => 23,
            Subclass::Unquelch => 24,
            Subclass::NotImplemented => 25,
            Subclass::Voice => 26,
            Subclass::Dtmf => 27,
            Subclass::Text => 28,
            Subclass::Noise => 29,
        }
    }

    fn from_wire(byte: u8) -> Option<Subclass> {
        Some(match byte {
            1 => Subclass::New,
            2 => Subclass::RegReq,
            3 => Subclass::RegRel,
            4 => Subclass::RegAck,
            5 => Subclass::RegRej,
            6 => Subclass::Poke,
            7 => Subclass::Pong,
            8 => Subclass::Ping,
            9 => Subclass::Ack,
            10 => Subclass::Hangup,
            11 => Subclass::Reject,
            12 => Subclass::Accept,
            13 => Subclass::AuthReq,
            14 => Subclass::AuthRep,
            15 => Subclass::Inval,
            16 => Subclass::Vnak,
            17 => Subclass::LagRq,
            18 => Subclass::LagRp,
            19 => Subclass::Busy,
            20 => Subclass::Answer,
            21 => Subclass::Ringing,
            22 => Subclass::Progressing,
            23 => Subclass::Quelch,
            24 => Subclass::Unquelch,
            25 => Subclass::NotImplemented,
            26 => Subclass::Voice,
            27 => Subclass::Dtmf,
            28 => Subclass::Text,
            29 => Subclass::Noise,
            _ => return None,
        })
    }
}

/// A 12-byte-header frame: sequenced, subject to retransmission and
/// acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullFrame {
    pub src_call: u16,
    pub dst_call: u16,
    pub retransmit: bool,
    pub timestamp: u32,
    pub o_seq_no: u8,
    pub i_seq_no: u8,
    pub subclass: Subclass,
    pub ies: IaxIeList,
    /// Raw payload for Voice/Dtmf/Text/Noise subclasses.
    pub payload: Vec<u8>,
}

impl FullFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FULL_FRAME_HEADER_LEN + 16);
        out.extend_from_slice(&(self.src_call | 0x8000).to_be_bytes());
        let dst = self.dst_call | if self.retransmit { 0x8000 } else { 0 };
        out.extend_from_slice(&dst.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.push(self.o_seq_no);
        out.push(self.i_seq_no);
        out.push(self.subclass.frame_type().to_wire());
        out.push(self.subclass.to_wire());
        if self.subclass.carries_ies() {
            out.extend_from_slice(&self.ies.encode());
        } else {
            out.extend_from_slice(&self.payload);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FULL_FRAME_HEADER_LEN {
            return Err(FrameError::TooShort {
                min: FULL_FRAME_HEADER_LEN,
            });
        }
        let src_call = u16::from_be_bytes([bytes[0], bytes[1]]) & 0x7fff;
        let dst_raw = u16::from_be_bytes([bytes[2], bytes[3]]);
        let retransmit = dst_raw & 0x8000 != 0;
        let dst_call = dst_raw & 0x7fff;
        let timestamp = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let o_seq_no = bytes[8];
        let i_seq_no = bytes[9];
        let frame_type_byte = bytes[10];
        let subclass_byte = bytes[11];
        let subclass = Subclass::from_wire(subclass_byte).ok_or(FrameError::UnknownSubclass {
            frame_type: frame_type_byte,
            subclass: subclass_byte,
        })?;
        if FrameType::from_wire(frame_type_byte) != Some(subclass.frame_type()) {
            return Err(FrameError::UnknownSubclass {
                frame_type: frame_type_byte,
                subclass: subclass_byte,
            });
        }

        let rest = &bytes[FULL_FRAME_HEADER_LEN..];
        let (ies, payload) = if subclass.carries_ies() {
            (IaxIeList::decode(rest)?, Vec::new())
        } else {
            (IaxIeList::new(), rest.to_vec())
        };

        Ok(Self {
            src_call,
            dst_call,
            retransmit,
            timestamp,
            o_seq_no,
            i_seq_no,
            subclass,
            ies,
            payload,
        })
    }
}

/// A 4-byte-header unacknowledged voice frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiniFrame {
    pub src_call: u16,
    pub timestamp16: u16,
    pub payload: Vec<u8>,
}

impl MiniFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MINI_FRAME_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&(self.src_call & 0x7fff).to_be_bytes());
        out.extend_from_slice(&self.timestamp16.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < MINI_FRAME_HEADER_LEN {
            return Err(FrameError::TooShort {
                min: MINI_FRAME_HEADER_LEN,
            });
        }
        let src_call = u16::from_be_bytes([bytes[0], bytes[1]]) & 0x7fff;
        let timestamp16 = u16::from_be_bytes([bytes[2], bytes[3]]);
        Ok(Self {
            src_call,
            timestamp16,
            payload: bytes[MINI_FRAME_HEADER_LEN..].to_vec(),
        })
    }
}

/// Either frame shape, distinguished on the wire by the high bit of the
/// first 16-bit word (set for full frames, clear for mini-frames).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Full(FullFrame),
    Mini(MiniFrame),
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Full(f) => f.encode(),
            Frame::Mini(m) => m.encode(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 2 {
            return Err(FrameError::TooShort { min: 2 });
        }
        let is_full = bytes[0] & 0x80 != 0;
        if is_full {
            FullFrame::decode(bytes).map(Frame::Full)
        } else {
            MiniFrame::decode(bytes).map(Frame::Mini)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code: unwrap/expect are acceptable
mod tests {
    use super::*;
    use crate::ie::InfoElement;

    #[test]
    fn full_frame_with_ies_round_trips() {
        let frame = FullFrame {
            src_call: 100,
            dst_call: 200,
            retransmit: false,
            timestamp: 12345,
            o_seq_no: 3,
            i_seq_no: 4,
            subclass: Subclass::New,
            ies: IaxIeList::new().with(InfoElement::Username("bob".into())),
            payload: Vec::new(),
        };
        let bytes = frame.encode();
        let decoded = Frame::decode(&bytes).expect("well-formed");
        assert_eq!(decoded, Frame::Full(frame));
    }

    #[test]
    fn voice_full_frame_round_trips_payload() {
        let frame = FullFrame {
            src_call: 1,
            dst_call: 1,
            retransmit: true,
            timestamp: 7,
            o_seq_no: 0,
            i_seq_no: 0,
            subclass: Subclass::Voice,
            ies: IaxIeList::new(),
            payload: vec![1, 2, 3, 4],
        };
        let bytes = frame.encode();
        let decoded = Frame::decode(&bytes).expect("well-formed");
        assert_eq!(decoded, Frame::Full(frame));
    }

    #[test]
    fn mini_frame_round_trips() {
        let frame = MiniFrame {
            src_call: 55,
            timestamp16: 999,
            payload: vec![9, 9, 9],
        };
        let bytes = frame.encode();
        assert_eq!(bytes[0] & 0x80, 0);
        let decoded = Frame::decode(&bytes).expect("well-formed");
        assert_eq!(decoded, Frame::Mini(frame));
    }

    #[test]
    fn too_short_is_rejected() {
        let err = Frame::decode(&[0x80]).unwrap_err();
        assert!(matches!(err, FrameError::TooShort { .. }));
    }

    #[test]
    fn header_carries_distinct_frame_type_and_subclass_bytes() {
        let frame = FullFrame {
            src_call: 1,
            dst_call: 2,
            retransmit: false,
            timestamp: 0,
            o_seq_no: 0,
            i_seq_no: 0,
            subclass: Subclass::New,
            ies: IaxIeList::new(),
            payload: Vec::new(),
        };
        let bytes = frame.encode();
        assert_eq!(bytes.len(), FULL_FRAME_HEADER_LEN);
        assert_eq!(bytes[10], FrameType::Iax.to_wire());
        assert_eq!(bytes[11], Subclass::New.to_wire());
    }

    #[test]
    fn mismatched_frame_type_byte_is_rejected() {
        let frame = FullFrame {
            src_call: 1,
            dst_call: 2,
            retransmit: false,
            timestamp: 0,
            o_seq_no: 0,
            i_seq_no: 0,
            subclass: Subclass::New,
            ies: IaxIeList::new(),
            payload: Vec::new(),
        };
        let mut bytes = frame.encode();
        bytes[10] = FrameType::Voice.to_wire();
        let err = Frame::decode(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::UnknownSubclass { .. }));
    }
}
