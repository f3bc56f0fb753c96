//! 전송 설정
//!
//! 펌웨어 리비전마다 트리거 값, 채널 배치, ready 신호 여부가 다르다.
//! 하드코딩하지 않고 프로파일(프리셋 생성자)로 표현한다.

use std::time::Duration;

use crate::gif::{GifLimits, Violation};
use crate::link::Channel;
use crate::{Error, Result, DEFAULT_MTU, DISPLAY_HEIGHT, DISPLAY_WIDTH};

/// 트리거 값 해석
///
/// 캡처된 값(0x00104000)이 바이트 수인지 명령 코드인지 확정되지 않았으므로
/// 둘 다 설정으로 고를 수 있다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerValue {
    /// 페이로드 길이
    PayloadLength,
    /// 고정 명령 코드
    Fixed(u32),
}

impl TriggerValue {
    /// 실제로 쓸 4바이트 (리틀엔디안)
    ///
    /// 길이가 u32를 넘으면 잘린 값을 보내지 않고 `InvalidPayload`.
    pub fn encode(self, payload_len: usize) -> Result<[u8; 4]> {
        let value = match self {
            TriggerValue::PayloadLength => {
                u32::try_from(payload_len).map_err(|_| Error::InvalidPayload {
                    violations: vec![Violation::TooLarge { len: payload_len }],
                })?
            }
            TriggerValue::Fixed(v) => v,
        };
        Ok(value.to_le_bytes())
    }
}

/// DOTT 전송 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// MTU 협상 실패 시 사용할 기본 MTU
    pub default_mtu: usize,

    /// 원시 스트림 트리거 값
    pub trigger: TriggerValue,

    /// 트리거를 쓸 채널
    pub trigger_channel: Channel,

    /// 트리거를 write-with-response로 보낼지
    pub trigger_needs_ack: bool,

    /// 원시 데이터 채널
    pub data_channel: Channel,

    /// 완료/실패 알림을 받을 채널들
    pub notify_channels: Vec<Channel>,

    /// 트리거 후 ready 신호(0xFFFFFFFF)를 기다릴지
    pub wait_for_ready: bool,

    /// ready 신호 대기 (밀리초)
    pub ready_timeout_ms: u64,

    /// 원시 스트림 청크 간격 (밀리초)
    pub chunk_interval_ms: u64,

    /// 마지막 청크 후 완료 알림 대기 (밀리초)
    pub completion_wait_ms: u64,

    /// 첫 재시도 대기 (밀리초)
    pub backoff_base_ms: u64,

    /// 재시도 대기 상한 (밀리초)
    pub backoff_ceiling_ms: u64,

    /// 청크당 최대 시도 횟수
    pub max_retries: u32,

    /// 알림 큐 크기
    pub notify_queue_capacity: usize,

    /// SMP 채널
    pub smp_channel: Channel,

    /// 펌웨어 이미지 슬롯
    pub image_slot: u32,

    /// SMP 업로드 청크 데이터 상한 (바이트)
    pub framed_chunk_limit: usize,

    /// SMP 청크 응답 대기 (밀리초)
    pub response_timeout_ms: u64,

    /// SMP 청크 간격 (밀리초)
    pub framed_interval_ms: u64,

    /// 디스플레이 최대 너비
    pub max_width: u16,

    /// 디스플레이 최대 높이
    pub max_height: u16,

    /// GIF 블록 구조까지 검사
    pub deep_frame_check: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_mtu: DEFAULT_MTU,
            trigger: TriggerValue::PayloadLength,
            trigger_channel: Channel::Trigger,
            trigger_needs_ack: true,
            data_channel: Channel::Data,
            notify_channels: vec![Channel::Trigger, Channel::Status, Channel::Response],
            wait_for_ready: true,
            ready_timeout_ms: 5000,           // 5초
            chunk_interval_ms: 5,
            completion_wait_ms: 3000,         // 3초
            backoff_base_ms: 50,
            backoff_ceiling_ms: 1000,
            max_retries: 5,
            notify_queue_capacity: 64,
            smp_channel: Channel::Smp,
            image_slot: 0,
            framed_chunk_limit: 128,          // BLE에서 보수적인 값
            response_timeout_ms: 10_000,      // 10초
            framed_interval_ms: 10,
            max_width: DISPLAY_WIDTH,
            max_height: DISPLAY_HEIGHT,
            deep_frame_check: true,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 캡처된 트리거 명령(00 40 10 00)을 쓰는 펌웨어
    pub fn captured_command() -> Self {
        Self {
            trigger: TriggerValue::Fixed(0x0010_4000),
            ready_timeout_ms: 2000,
            completion_wait_ms: 1500,
            ..Self::default()
        }
    }

    /// 트리거와 데이터를 모두 데이터 채널로 보내는 펌웨어
    ///
    /// ready 신호를 보내지 않는다.
    pub fn single_channel() -> Self {
        Self {
            trigger_channel: Channel::Data,
            trigger_needs_ack: false,
            notify_channels: vec![Channel::Data, Channel::Status, Channel::Response],
            wait_for_ready: false,
            completion_wait_ms: 1500,
            ..Self::default()
        }
    }

    /// 이름으로 프로파일 선택
    pub fn profile(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default()),
            "captured" => Some(Self::captured_command()),
            "single" => Some(Self::single_channel()),
            _ => None,
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }

    pub fn completion_wait(&self) -> Duration {
        Duration::from_millis(self.completion_wait_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn framed_interval(&self) -> Duration {
        Duration::from_millis(self.framed_interval_ms)
    }

    /// GIF 검증 한도
    pub fn gif_limits(&self) -> GifLimits {
        GifLimits {
            max_width: self.max_width,
            max_height: self.max_height,
            deep: self.deep_frame_check,
        }
    }
}
