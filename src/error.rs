//! 에러 타입 정의

use thiserror::Error;

use crate::gif::Violation;
use crate::link::Channel;

/// DOTT 전송 엔진 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("유효하지 않은 페이로드: {}", format_violations(.violations))]
    InvalidPayload { violations: Vec<Violation> },

    #[error("잘못된 패킷: expected {expected} bytes, got {got}")]
    MalformedPacket { expected: usize, got: usize },

    #[error("CBOR 코덱 에러: {0}")]
    Codec(#[from] crate::cbor::CborError),

    #[error("패킷 페이로드가 너무 큼: {size} bytes (최대 65535)")]
    PacketTooLarge { size: usize },

    #[error("링크 쓰기 실패 ({channel}): {reason}")]
    LinkWriteFailed { channel: Channel, reason: String },

    #[error("링크 연결 끊김")]
    Disconnected,

    #[error("트리거 전송 실패: {attempts}회 시도")]
    HandshakeFailed { attempts: u32 },

    #[error("디바이스가 청크 거부: rc={code}, offset={offset}")]
    DeviceRejectedChunk { code: i64, offset: usize },

    #[error("청크 전달 실패: offset={offset}, {attempts}회 시도")]
    ChunkDeliveryFailed { offset: usize, attempts: u32 },

    #[error("타임아웃 ({stage}): offset={offset}")]
    Timeout { stage: &'static str, offset: usize },

    #[error("디바이스 상태 코드 에러: rc={code}")]
    DeviceStatus { code: i64 },

    #[error("디바이스 실패 보고: {message:?}")]
    DeviceReportedFailure { message: String },

    #[error("디바이스 오프셋 범위 초과: offset={offset}, total={total}")]
    UnexpectedOffset { offset: usize, total: usize },

    #[error("전송 계층 에러: {0}")]
    Transport(String),
}

impl Error {
    /// 재시도 루프가 다시 시도해도 되는 에러인지
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::LinkWriteFailed { .. } | Error::Timeout { .. } | Error::MalformedPacket { .. }
        )
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let write = Error::LinkWriteFailed {
            channel: Channel::Data,
            reason: "busy".into(),
        };
        assert!(write.is_transient());
        assert!(Error::Timeout { stage: "response", offset: 0 }.is_transient());
        assert!(!Error::Disconnected.is_transient());
        assert!(!Error::ChunkDeliveryFailed { offset: 0, attempts: 5 }.is_transient());
    }

    #[test]
    fn test_invalid_payload_lists_violations() {
        let err = Error::InvalidPayload {
            violations: vec![Violation::TooSmall { len: 12 }, Violation::BadMagic],
        };
        let text = err.to_string();
        assert!(text.contains("12"));
        assert!(text.contains("magic"));
    }
}
