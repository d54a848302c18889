//! Protocol Data Unit framing and typed payloads.
//!
//! Every exchange on the wire is one frame:
//!
//! ```text
//! +--------+--------+--------+-----------------+----------+
//! | length | type   | from   | payload ...     | length   |
//! | u32 BE | i32 BE | i32 BE | type-specific   | u32 BE   |
//! +--------+--------+--------+-----------------+----------+
//! ```
//!
//! `length` covers the header, the payload and the trailer. Frames are kept
//! in a single reference-counted buffer so a relayed frame is forwarded
//! without copying and released when the last handle drops.

mod creds;
mod ident;
mod message;
mod wire;

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

pub use creds::{AuthStep, CredKind, Credential, IpcFlags, PDU_VERSION};
pub use ident::{InDom, PduInfo, PmId};
pub use message::{
    BlockValue, ControlReq, CredsPdu, Desc, ErrorPdu, FetchReq, InDomProfile, InsituValue,
    InstanceEntry, InstanceReq, InstanceResult, NameEntry, Pdu, PmResult, PmnsChild, PmnsIds,
    PmnsNames, PmnsTraverse, Profile, SlotWidth, Text, TextReq, Timeval, ValueBlock, ValueList,
    ValueSet,
};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 12;
/// Size of the trailing length repeat.
pub const TRAILER_LEN: usize = 4;
/// Smallest frame that can be valid.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TRAILER_LEN;

/// Unit in which client PDU ceilings are expressed.
pub const PDU_CHUNK: usize = 1024;
/// Ceiling applied to PDUs arriving from untrusted peers.
pub const LIMIT_SIZE_CEILING: usize = 64 * PDU_CHUNK;

/// How large an incoming frame may be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeLimit {
    /// Enforce a byte ceiling (client-originated traffic)
    Limit(usize),
    /// Accept anything the header announces
    Any,
}

impl SizeLimit {
    pub fn permits(&self, len: usize) -> bool {
        match self {
            SizeLimit::Limit(max) => len <= *max,
            SizeLimit::Any => true,
        }
    }
}

impl Default for SizeLimit {
    fn default() -> Self {
        SizeLimit::Limit(LIMIT_SIZE_CEILING)
    }
}

/// First PDU type code.
pub const PDU_START: i32 = 0x7000;
/// Last PDU type code.
pub const PDU_FINISH: i32 = 0x7010;
/// Span of the type code range, used to size per-type tables.
pub const PDU_MAX: i32 = PDU_FINISH - PDU_START;

/// The closed set of PDU kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PduType {
    Error        = 0x7000,
    Result       = 0x7001,
    Profile      = 0x7002,
    Fetch        = 0x7003,
    DescReq      = 0x7004,
    Desc         = 0x7005,
    InstanceReq  = 0x7006,
    Instance     = 0x7007,
    TextReq      = 0x7008,
    Text         = 0x7009,
    ControlReq   = 0x700a,
    // 0x700b is retired and decodes as unknown
    Creds        = 0x700c,
    PmnsIds      = 0x700d,
    PmnsNames    = 0x700e,
    PmnsChild    = 0x700f,
    PmnsTraverse = 0x7010,
}

impl PduType {
    /// Every kind, in type-code order.
    pub const ALL: [PduType; 16] = [
        PduType::Error,
        PduType::Result,
        PduType::Profile,
        PduType::Fetch,
        PduType::DescReq,
        PduType::Desc,
        PduType::InstanceReq,
        PduType::Instance,
        PduType::TextReq,
        PduType::Text,
        PduType::ControlReq,
        PduType::Creds,
        PduType::PmnsIds,
        PduType::PmnsNames,
        PduType::PmnsChild,
        PduType::PmnsTraverse,
    ];

    pub fn from_code(code: i32) -> Result<Self, DecodeError> {
        match code {
            0x7000 => Ok(PduType::Error),
            0x7001 => Ok(PduType::Result),
            0x7002 => Ok(PduType::Profile),
            0x7003 => Ok(PduType::Fetch),
            0x7004 => Ok(PduType::DescReq),
            0x7005 => Ok(PduType::Desc),
            0x7006 => Ok(PduType::InstanceReq),
            0x7007 => Ok(PduType::Instance),
            0x7008 => Ok(PduType::TextReq),
            0x7009 => Ok(PduType::Text),
            0x700a => Ok(PduType::ControlReq),
            0x700c => Ok(PduType::Creds),
            0x700d => Ok(PduType::PmnsIds),
            0x700e => Ok(PduType::PmnsNames),
            0x700f => Ok(PduType::PmnsChild),
            0x7010 => Ok(PduType::PmnsTraverse),
            other => Err(DecodeError::UnknownType(other)),
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            PduType::Error => "ERROR",
            PduType::Result => "RESULT",
            PduType::Profile => "PROFILE",
            PduType::Fetch => "FETCH",
            PduType::DescReq => "DESC_REQ",
            PduType::Desc => "DESC",
            PduType::InstanceReq => "INSTANCE_REQ",
            PduType::Instance => "INSTANCE",
            PduType::TextReq => "TEXT_REQ",
            PduType::Text => "TEXT",
            PduType::ControlReq => "CONTROL_REQ",
            PduType::Creds => "CREDS",
            PduType::PmnsIds => "PMNS_IDS",
            PduType::PmnsNames => "PMNS_NAMES",
            PduType::PmnsChild => "PMNS_CHILD",
            PduType::PmnsTraverse => "PMNS_TRAVERSE",
        }
    }
}

impl fmt::Display for PduType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reasons a byte sequence is not a well-formed PDU.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated frame: need {need} bytes, have {have}")]
    TruncatedFrame { need: usize, have: usize },

    #[error("unknown PDU type {0:#x}")]
    UnknownType(i32),

    #[error("{kind} payload does not match its field counts: {detail}")]
    FieldCountMismatch { kind: PduType, detail: String },

    #[error("frame length {0} is shorter than the frame header")]
    BadLength(u32),

    #[error("trailer length {trailer} disagrees with header length {header}")]
    CorruptTrailer { header: u32, trailer: u32 },
}

/// The fixed leading part of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub length:   u32,
    pub pdu_type: PduType,
    pub origin:   i32,
}

impl PduHeader {
    /// Parses and validates the 12 header bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::TruncatedFrame {
                need: HEADER_LEN,
                have: bytes.len(),
            });
        }
        let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if (length as usize) < MIN_FRAME_LEN {
            return Err(DecodeError::BadLength(length));
        }
        let code = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let pdu_type = PduType::from_code(code)?;
        let origin = i32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        Ok(Self {
            length,
            pdu_type,
            origin,
        })
    }
}

/// One complete frame held in a shared buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct PduFrame {
    header: PduHeader,
    raw:    Bytes,
}

impl PduFrame {
    /// Frames `payload` under the given type and origin.
    pub fn new(pdu_type: PduType, origin: i32, payload: &[u8]) -> Self {
        let length = (MIN_FRAME_LEN + payload.len()) as u32;
        let mut buf = BytesMut::with_capacity(length as usize);
        buf.put_u32(length);
        buf.put_i32(pdu_type.code());
        buf.put_i32(origin);
        buf.put_slice(payload);
        buf.put_u32(length);
        Self {
            header: PduHeader {
                length,
                pdu_type,
                origin,
            },
            raw: buf.freeze(),
        }
    }

    /// Validates `raw` as a single frame. Bytes past the announced length
    /// are ignored.
    pub fn parse(raw: Bytes) -> Result<Self, DecodeError> {
        if raw.len() < 4 {
            return Err(DecodeError::TruncatedFrame {
                need: MIN_FRAME_LEN,
                have: raw.len(),
            });
        }
        let announced = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if announced >= MIN_FRAME_LEN && raw.len() < announced {
            return Err(DecodeError::TruncatedFrame {
                need: announced,
                have: raw.len(),
            });
        }
        let header = PduHeader::parse(&raw)?;
        let len = header.length as usize;
        let raw = raw.slice(..len);
        let trailer = u32::from_be_bytes([raw[len - 4], raw[len - 3], raw[len - 2], raw[len - 1]]);
        if trailer != header.length {
            return Err(DecodeError::CorruptTrailer {
                header: header.length,
                trailer,
            });
        }
        Ok(Self { header, raw })
    }

    pub fn header(&self) -> PduHeader {
        self.header
    }

    pub fn pdu_type(&self) -> PduType {
        self.header.pdu_type
    }

    pub fn origin(&self) -> i32 {
        self.header.origin
    }

    pub fn length(&self) -> u32 {
        self.header.length
    }

    /// The type-specific bytes between header and trailer.
    pub fn payload(&self) -> Bytes {
        self.raw.slice(HEADER_LEN..self.raw.len() - TRAILER_LEN)
    }

    /// The complete frame as it travels on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_bytes(self) -> Bytes {
        self.raw
    }
}

impl fmt::Debug for PduFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PduFrame")
            .field("type", &self.header.pdu_type)
            .field("length", &self.header.length)
            .field("origin", &self.header.origin)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn type_codes_are_contiguous_apart_from_retired_slot() {
        assert_eq!(PduType::ALL.len() as i32, PDU_MAX);
        for pair in PduType::ALL.windows(2) {
            let gap = pair[1].code() - pair[0].code();
            if pair[0] == PduType::ControlReq {
                assert_eq!(gap, 2);
            } else {
                assert_eq!(gap, 1);
            }
        }
        assert_eq!(PduType::ALL[0].code(), PDU_START);
        assert_eq!(PduType::ALL[15].code(), PDU_FINISH);
    }

    #[test]
    fn retired_and_foreign_codes_are_unknown() {
        assert_eq!(PduType::from_code(0x700b), Err(DecodeError::UnknownType(0x700b)));
        assert_eq!(PduType::from_code(0x6fff), Err(DecodeError::UnknownType(0x6fff)));
        assert_eq!(PduType::from_code(-1), Err(DecodeError::UnknownType(-1)));
    }

    #[test]
    fn frame_layout_is_big_endian_with_trailer() {
        let frame = PduFrame::new(PduType::Text, 7, &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            frame.as_bytes(),
            &[
                0, 0, 0, 20, 0, 0, 0x70, 0x09, 0, 0, 0, 7, 0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 20
            ]
        );
        assert_eq!(&frame.payload()[..], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn corrupt_trailer_is_rejected() {
        let frame = PduFrame::new(PduType::DescReq, 0, &[0, 0, 0, 1]);
        let mut raw = BytesMut::from(frame.as_bytes());
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(matches!(
            PduFrame::parse(raw.freeze()),
            Err(DecodeError::CorruptTrailer { .. })
        ));
    }

    #[test]
    fn short_length_field_is_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u32(8);
        raw.put_i32(PduType::Error.code());
        raw.put_i32(0);
        raw.put_u32(8);
        assert_eq!(PduFrame::parse(raw.freeze()), Err(DecodeError::BadLength(8)));
    }

    #[test]
    fn size_limit_ceiling() {
        let limit = SizeLimit::default();
        assert!(limit.permits(LIMIT_SIZE_CEILING));
        assert!(!limit.permits(LIMIT_SIZE_CEILING + 1));
        assert!(SizeLimit::Any.permits(usize::MAX));
    }

    proptest! {
        #[test]
        fn any_truncation_is_reported(payload in proptest::collection::vec(any::<u8>(), 0..64), cut in 1usize..80) {
            let frame = PduFrame::new(PduType::Text, 3, &payload);
            let full = frame.as_bytes().len();
            let cut = cut.min(full);
            let truncated = frame.into_bytes().slice(..full - cut);
            let is_truncated = matches!(
                PduFrame::parse(truncated),
                Err(DecodeError::TruncatedFrame { .. })
            );
            prop_assert!(is_truncated);
        }
    }
}
