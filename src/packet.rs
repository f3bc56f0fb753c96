//! 구조화 패킷 코덱 (MCUmgr SMP)
//!
//! 고정 8바이트 빅엔디안 헤더 + CBOR 맵 페이로드
//!
//! ```text
//! [op:1][flags:1][len:2 BE][group:2 BE][seq:1][cmd:1][payload: len bytes]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::cbor::{self, Fields};
use crate::{Error, Result};

/// 헤더 크기 (바이트)
pub const HEADER_SIZE: usize = 8;

/// 그룹 ID
pub mod group {
    pub const OS: u16 = 0;
    pub const IMAGE: u16 = 1;
}

/// 커맨드 ID
pub mod command {
    /// OS 그룹: 리셋
    pub const OS_RESET: u8 = 5;
    /// 이미지 그룹: 상태 조회/확정
    pub const IMAGE_STATE: u8 = 0;
    /// 이미지 그룹: 업로드
    pub const IMAGE_UPLOAD: u8 = 1;
}

/// 동작 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Read = 0,
    ReadResponse = 1,
    Write = 2,
    WriteResponse = 3,
}

impl OpKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpKind::Read),
            1 => Some(OpKind::ReadResponse),
            2 => Some(OpKind::Write),
            3 => Some(OpKind::WriteResponse),
            _ => None,
        }
    }

    /// 요청에 대응하는 응답 op
    pub fn response(self) -> Self {
        match self {
            OpKind::Read | OpKind::ReadResponse => OpKind::ReadResponse,
            OpKind::Write | OpKind::WriteResponse => OpKind::WriteResponse,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(self, OpKind::ReadResponse | OpKind::WriteResponse)
    }
}

/// 패킷 헤더
///
/// `op`는 원시 값 그대로 둔다. 알 수 없는 op도 디코딩은 되어야 하므로.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub op: u8,
    pub flags: u8,
    pub len: u16,
    pub group: u16,
    pub seq: u8,
    pub command: u8,
}

impl PacketHeader {
    pub fn op_kind(&self) -> Option<OpKind> {
        OpKind::from_u8(self.op)
    }
}

/// 패킷 페이로드
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    /// 디코딩된 키/값 맵
    Fields(Fields),
    /// 파싱할 수 없는 페이로드 원본
    Raw(Bytes),
}

impl PacketBody {
    pub fn fields(&self) -> Option<&Fields> {
        match self {
            PacketBody::Fields(f) => Some(f),
            PacketBody::Raw(_) => None,
        }
    }
}

/// 디코딩된 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: PacketBody,
}

/// 패킷 인코딩 (flags는 항상 0)
pub fn encode(op: OpKind, group: u16, command: u8, fields: &Fields, seq: u8) -> Result<Bytes> {
    let payload = cbor::encode_fields(fields)?;
    let len = u16::try_from(payload.len()).map_err(|_| Error::PacketTooLarge {
        size: payload.len(),
    })?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(op as u8);
    buf.put_u8(0);
    buf.put_u16(len);
    buf.put_u16(group);
    buf.put_u8(seq);
    buf.put_u8(command);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// 헤더만 파싱
pub fn decode_header(bytes: &[u8]) -> Result<PacketHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::MalformedPacket {
            expected: HEADER_SIZE,
            got: bytes.len(),
        });
    }
    Ok(PacketHeader {
        op: bytes[0],
        flags: bytes[1],
        len: u16::from_be_bytes([bytes[2], bytes[3]]),
        group: u16::from_be_bytes([bytes[4], bytes[5]]),
        seq: bytes[6],
        command: bytes[7],
    })
}

/// 패킷 디코딩
///
/// 반환: (패킷, 선언된 길이 뒤에 남은 바이트)
///
/// 페이로드가 CBOR로 파싱되지 않으면 에러 대신 `PacketBody::Raw`를 돌려준다.
pub fn decode(bytes: &[u8]) -> Result<(Packet, &[u8])> {
    let header = decode_header(bytes)?;
    let total = HEADER_SIZE + header.len as usize;
    if bytes.len() < total {
        return Err(Error::MalformedPacket {
            expected: total,
            got: bytes.len(),
        });
    }

    let payload = &bytes[HEADER_SIZE..total];
    let body = if payload.is_empty() {
        PacketBody::Fields(Fields::new())
    } else {
        match cbor::decode_fields(payload) {
            Ok(fields) => PacketBody::Fields(fields),
            Err(e) => {
                debug!("페이로드 CBOR 파싱 실패, 원본 유지: {}", e);
                PacketBody::Raw(Bytes::copy_from_slice(payload))
            }
        }
    };

    Ok((Packet { header, body }, &bytes[total..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbor::Value;

    #[test]
    fn test_header_layout() {
        let fields = Fields::new().with("off", 0u32);
        let bytes = encode(OpKind::Write, group::IMAGE, command::IMAGE_UPLOAD, &fields, 0x2A).unwrap();
        let payload_len = bytes.len() - HEADER_SIZE;

        assert_eq!(bytes[0], 2);
        assert_eq!(bytes[1], 0);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]) as usize, payload_len);
        assert_eq!(&bytes[4..6], &[0x00, 0x01]);
        assert_eq!(bytes[6], 0x2A);
        assert_eq!(bytes[7], 1);
    }

    #[test]
    fn test_encode_decode() {
        let fields = Fields::new()
            .with("image", 0u32)
            .with("off", 4096u32)
            .with("data", &[1u8, 2, 3][..])
            .with("len", 123_456u32);
        let bytes = encode(OpKind::Write, group::IMAGE, command::IMAGE_UPLOAD, &fields, 255).unwrap();
        let (packet, rest) = decode(&bytes).unwrap();

        assert!(rest.is_empty());
        assert_eq!(packet.header.op_kind(), Some(OpKind::Write));
        assert_eq!(packet.header.group, group::IMAGE);
        assert_eq!(packet.header.seq, 255);
        assert_eq!(packet.header.command, command::IMAGE_UPLOAD);
        assert_eq!(packet.body, PacketBody::Fields(fields));
    }

    #[test]
    fn test_short_buffer_is_malformed() {
        assert!(matches!(
            decode(&[0x03, 0x00, 0x00]),
            Err(Error::MalformedPacket { expected: 8, got: 3 })
        ));
    }

    #[test]
    fn test_declared_length_exceeds_buffer() {
        let bytes = [0x03, 0x00, 0x00, 0x10, 0x00, 0x01, 0x05, 0x01, 0xA0];
        assert!(matches!(
            decode(&bytes),
            Err(Error::MalformedPacket { expected: 24, got: 9 })
        ));
    }

    #[test]
    fn test_unparseable_body_falls_back_to_raw() {
        let mut bytes = vec![0x03, 0x00, 0x00, 0x03, 0x00, 0x01, 0x05, 0x01];
        bytes.extend_from_slice(b"bad");
        let (packet, _) = decode(&bytes).unwrap();
        assert_eq!(packet.body, PacketBody::Raw(Bytes::from_static(b"bad")));
    }

    #[test]
    fn test_remainder_after_declared_length() {
        let fields = Fields::new().with("rc", 0u32);
        let mut bytes = encode(OpKind::WriteResponse, group::OS, command::OS_RESET, &fields, 1)
            .unwrap()
            .to_vec();
        bytes.extend_from_slice(&[0xDE, 0xAD]);
        let (packet, rest) = decode(&bytes).unwrap();
        assert_eq!(rest, &[0xDE, 0xAD]);
        assert_eq!(
            packet.body.fields().and_then(|f| f.get("rc")),
            Some(&Value::Unsigned(0))
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let big = vec![0u8; 70_000];
        let fields = Fields::new().with("data", &big[..]);
        assert!(matches!(
            encode(OpKind::Write, group::IMAGE, command::IMAGE_UPLOAD, &fields, 0),
            Err(Error::PacketTooLarge { .. })
        ));
    }
}
