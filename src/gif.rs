//! GIF 구조 검증
//!
//! 디바이스 렌더러 제약:
//! - 캔버스 최대 240x240
//! - 모든 프레임이 캔버스 전체 크기여야 함 (부분 프레임은 깨져서 표시됨)
//!
//! 검증 실패는 에러가 아니라 위반 목록으로 보고한다. 호출자가 무시할 수 있다.

use std::fmt;

/// 최소 크기 (헤더 6 + 논리 화면 기술자 7)
pub const MIN_GIF_SIZE: usize = 13;

/// 허용 매직
pub const GIF_MAGICS: [&[u8; 6]; 2] = [b"GIF87a", b"GIF89a"];

/// 트레일러 바이트
pub const GIF_TRAILER: u8 = 0x3B;

const EXTENSION_INTRODUCER: u8 = 0x21;
const IMAGE_SEPARATOR: u8 = 0x2C;

/// 검증 위반 항목
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Empty,
    TooLarge { len: usize },
    TooSmall { len: usize },
    BadMagic,
    ZeroDimension { width: u16, height: u16 },
    OversizedFrame { width: u16, height: u16 },
    TruncatedFile { trailer: u8 },
    PartialFrame { frame_index: usize, width: u16, height: u16 },
    MalformedBlock { offset: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Empty => write!(f, "empty payload"),
            Violation::TooLarge { len } => write!(f, "payload too large ({} bytes)", len),
            Violation::TooSmall { len } => write!(f, "file too small ({} bytes)", len),
            Violation::BadMagic => write!(f, "bad GIF magic"),
            Violation::ZeroDimension { width, height } => {
                write!(f, "zero dimension {}x{}", width, height)
            }
            Violation::OversizedFrame { width, height } => {
                write!(f, "image too large {}x{}", width, height)
            }
            Violation::TruncatedFile { trailer } => {
                write!(f, "missing trailer (last byte 0x{:02X})", trailer)
            }
            Violation::PartialFrame {
                frame_index,
                width,
                height,
            } => write!(f, "frame {} is partial ({}x{})", frame_index, width, height),
            Violation::MalformedBlock { offset } => write!(f, "malformed block at {}", offset),
        }
    }
}

/// 검증 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// 캔버스 너비 (헤더를 읽을 수 있을 때)
    pub width: u16,
    /// 캔버스 높이
    pub height: u16,
    /// 프레임 수 (깊은 검사 시)
    pub frames: usize,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// 검증 옵션
#[derive(Debug, Clone, Copy)]
pub struct GifLimits {
    pub max_width: u16,
    pub max_height: u16,
    /// 블록 구조까지 검사
    pub deep: bool,
}

impl Default for GifLimits {
    fn default() -> Self {
        Self {
            max_width: crate::DISPLAY_WIDTH,
            max_height: crate::DISPLAY_HEIGHT,
            deep: true,
        }
    }
}

/// GIF 검증
pub fn validate(data: &[u8], limits: &GifLimits) -> ValidationReport {
    let mut report = ValidationReport::default();

    if data.len() < MIN_GIF_SIZE {
        report.violations.push(Violation::TooSmall { len: data.len() });
    }
    if data.len() < 6 || !GIF_MAGICS.iter().any(|m| &data[..6] == m.as_slice()) {
        report.violations.push(Violation::BadMagic);
    }
    if !report.violations.is_empty() {
        return report;
    }

    let width = u16::from_le_bytes([data[6], data[7]]);
    let height = u16::from_le_bytes([data[8], data[9]]);
    report.width = width;
    report.height = height;

    if width == 0 || height == 0 {
        report.violations.push(Violation::ZeroDimension { width, height });
    } else if width > limits.max_width || height > limits.max_height {
        report.violations.push(Violation::OversizedFrame { width, height });
    }

    let last = data[data.len() - 1];
    if last != GIF_TRAILER {
        report.violations.push(Violation::TruncatedFile { trailer: last });
    }

    if limits.deep {
        let scan = scan_frames(data);
        report.frames = scan.frames;
        report.violations.extend(scan.violations);
    }

    report
}

/// 블록 구조 스캔 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameScan {
    pub frames: usize,
    pub violations: Vec<Violation>,
}

/// 블록 구조를 따라가며 각 프레임 크기를 캔버스와 비교
///
/// 입력은 건드리지 않는다. 헤더 검사를 통과한 데이터를 가정한다.
pub fn scan_frames(data: &[u8]) -> FrameScan {
    let mut scan = FrameScan::default();
    if data.len() < MIN_GIF_SIZE {
        return scan;
    }

    let canvas_w = u16::from_le_bytes([data[6], data[7]]);
    let canvas_h = u16::from_le_bytes([data[8], data[9]]);
    let packed = data[10];

    let mut pos = MIN_GIF_SIZE;
    if packed & 0x80 != 0 {
        pos += color_table_size(packed);
    }

    loop {
        let Some(&introducer) = data.get(pos) else {
            scan.violations.push(Violation::MalformedBlock { offset: pos });
            return scan;
        };

        match introducer {
            GIF_TRAILER => return scan,
            EXTENSION_INTRODUCER => {
                // introducer + label, 이후 sub-block들
                match skip_sub_blocks(data, pos + 2) {
                    Some(next) => pos = next,
                    None => {
                        scan.violations.push(Violation::MalformedBlock { offset: pos });
                        return scan;
                    }
                }
            }
            IMAGE_SEPARATOR => {
                // separator(1) left(2) top(2) width(2) height(2) packed(1)
                let Some(desc) = data.get(pos + 1..pos + 10) else {
                    scan.violations.push(Violation::MalformedBlock { offset: pos });
                    return scan;
                };
                let width = u16::from_le_bytes([desc[4], desc[5]]);
                let height = u16::from_le_bytes([desc[6], desc[7]]);
                let local_packed = desc[8];

                if width != canvas_w || height != canvas_h {
                    scan.violations.push(Violation::PartialFrame {
                        frame_index: scan.frames,
                        width,
                        height,
                    });
                }
                scan.frames += 1;

                let mut next = pos + 10;
                if local_packed & 0x80 != 0 {
                    next += color_table_size(local_packed);
                }
                // LZW 최소 코드 크기
                next += 1;
                match skip_sub_blocks(data, next) {
                    Some(after) => pos = after,
                    None => {
                        scan.violations.push(Violation::MalformedBlock { offset: pos });
                        return scan;
                    }
                }
            }
            _ => {
                scan.violations.push(Violation::MalformedBlock { offset: pos });
                return scan;
            }
        }
    }
}

fn color_table_size(packed: u8) -> usize {
    3 * (1usize << ((packed & 0x07) + 1))
}

/// sub-block 체인을 건너뛴 다음 위치 (종료 0 포함)
fn skip_sub_blocks(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *data.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            return Some(pos);
        }
        pos += len;
        if pos > data.len() {
            return None;
        }
    }
}
