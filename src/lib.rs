//! # DOTT (BLE 디스플레이 업로드 엔진)
//!
//! 원형 디스플레이 장치로 GIF 이미지와 펌웨어를 BLE로 올리는 전송 엔진
//!
//! ## 핵심 특징
//! - **두 가지 전송 방식**: 트리거 + 원시 스트림 (이미지), SMP 패킷 (펌웨어)
//! - **업로드 전 검증**: GIF 구조/크기 검사, 잘못된 파일은 보내지 않음
//! - **MTU 기반 청크 분할**: ATT 오버헤드를 뺀 크기로 나눔
//! - **디바이스 주도 재개**: SMP 응답 오프셋에서 이어서 전송
//! - **백오프 재시도**: 쓰기 실패 시 지수 백오프, 상한 초과 시 실패
//! - **알림 분류**: 텍스트 알림으로 완료/실패/진행 판정, 모르면 Unknown
//! - **링크 추상화**: `Link` 트레이트, BLE 구현은 `ble` feature

pub mod backoff;
pub mod cbor;
pub mod chunk;
pub mod config;
pub mod error;
pub mod gif;
pub mod link;
pub mod notify;
pub mod packet;
pub mod payload;
pub mod session;
pub mod smp;
pub mod stats;

#[cfg(feature = "ble")]
pub mod ble;

pub use backoff::BackoffPolicy;
pub use chunk::{chunk_size_for_mtu, Chunk, Chunker};
pub use config::{Config, TriggerValue};
pub use error::{Error, Result};
pub use gif::{GifLimits, ValidationReport, Violation};
pub use link::{Channel, Link, Notification};
pub use notify::{classify, Classification};
pub use payload::{Payload, PayloadKind};
pub use session::{
    Evidence, TransferMode, TransferOutcome, TransferReport, TransferSession, TransferState,
};
pub use smp::{ImageSlot, SmpClient};
pub use stats::TransferStats;

/// ATT 헤더 오버헤드 (opcode 1 + handle 2)
pub const ATT_OVERHEAD: usize = 3;

/// 최소 청크 크기 (기본 MTU 23 - 3)
pub const MIN_CHUNK_SIZE: usize = 20;

/// MTU 협상 실패 시 기본값
pub const DEFAULT_MTU: usize = 23;

/// 디바이스 ready 신호
pub const READY_SIGNAL: [u8; 4] = [0xFF; 4];

/// 디스플레이 해상도
pub const DISPLAY_WIDTH: u16 = 240;
pub const DISPLAY_HEIGHT: u16 = 240;
