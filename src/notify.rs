//! 알림 분류기
//!
//! 디바이스의 비동기 채널은 프레이밍이 없는 텍스트 프로토콜이다.
//! 휴리스틱이라 Unknown이 나올 수 있고, Unknown은 절대 성공으로 취급하지 않는다.

use std::fmt;

use crate::READY_SIGNAL;

/// 진행 중임을 나타내는 펌웨어 문자열 조각
const PROGRESS_MARKERS: [&str; 4] = ["received", "started", "waiting", "progress"];

/// 분류 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Progress,
    Complete,
    Failed,
    ReadySignal,
    Unknown,
}

impl Classification {
    /// 전송 결과를 확정하는 분류인지
    pub fn is_terminal(self) -> bool {
        matches!(self, Classification::Complete | Classification::Failed)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Classification::Progress => "progress",
            Classification::Complete => "complete",
            Classification::Failed => "failed",
            Classification::ReadySignal => "ready",
            Classification::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// 알림 텍스트 (UTF-8 best-effort, NUL 패딩 제거)
pub fn notification_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_matches('\0').trim().to_string()
}

/// 알림 분류
///
/// "fail"과 "complete"가 함께 있으면 실패로 본다.
pub fn classify(raw: &[u8]) -> Classification {
    if raw == &READY_SIGNAL[..] {
        return Classification::ReadySignal;
    }

    let text = notification_text(raw).to_lowercase();
    if text.contains("fail") {
        Classification::Failed
    } else if text.contains("complete") {
        Classification::Complete
    } else if PROGRESS_MARKERS.iter().any(|m| text.contains(m)) {
        Classification::Progress
    } else {
        Classification::Unknown
    }
}
