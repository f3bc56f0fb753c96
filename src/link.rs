//! 링크 추상화
//!
//! 엔진은 이미 연결된 링크만 받는다. 디바이스 검색, 페어링, 연결 관리는
//! 링크 구현체의 몫이다.
//!
//! 알림은 공유 리스트가 아니라 세션이 소유한 bounded 큐로 들어온다.
//! 링크의 알림 콜백은 큐에 넣기만 하고, 세션이 유일한 소비자다.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// 논리 채널 (BLE characteristic에 대응)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// 트리거/크기 헤더 채널 (0x1528, indicate)
    Trigger,
    /// 원시 데이터 채널 (0x1525)
    Data,
    /// 상태 알림 채널 (0x1529)
    Status,
    /// 응답 알림 채널 (0x1530)
    Response,
    /// MCUmgr SMP 채널
    Smp,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Trigger => "trigger",
            Channel::Data => "data",
            Channel::Status => "status",
            Channel::Response => "response",
            Channel::Smp => "smp",
        };
        f.write_str(name)
    }
}

/// 디바이스에서 온 비동기 알림
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: Channel,
    pub data: Bytes,
}

impl Notification {
    pub fn new(channel: Channel, data: impl Into<Bytes>) -> Self {
        Self {
            channel,
            data: data.into(),
        }
    }
}

/// 알림 큐 송신측
pub type NotificationSink = mpsc::Sender<Notification>;

/// 알림 큐 수신측
pub type NotificationQueue = mpsc::Receiver<Notification>;

/// 전송 엔진이 사용하는 링크
///
/// 한 링크는 동시에 한 세션만 사용한다.
#[async_trait]
pub trait Link: Send + Sync {
    /// 협상된 MTU (ATT 오버헤드 포함)
    async fn negotiate_mtu(&self) -> Result<usize>;

    /// 채널에 쓰기. `needs_ack`이면 write-with-response
    ///
    /// 일시적 실패는 `Error::LinkWriteFailed`, 연결 끊김은 `Error::Disconnected`
    async fn write(&self, channel: Channel, data: &[u8], needs_ack: bool) -> Result<()>;

    /// 채널 알림을 `sink`로 전달하도록 등록
    ///
    /// 같은 채널에 여러 번 등록할 수 있고, 닫힌 sink는 구현체가 정리한다.
    /// 모든 sink가 drop되면 세션은 링크가 끊긴 것으로 본다.
    async fn subscribe(&self, channel: Channel, sink: NotificationSink) -> Result<()>;

    /// 동기 characteristic 읽기
    async fn read(&self, channel: Channel) -> Result<Bytes>;
}

/// 알림을 큐에 넣는다. 큐가 가득 차면 버리고 false
///
/// 링크 콜백은 블록되면 안 되므로 try_send만 쓴다.
pub fn deliver(sink: &NotificationSink, notification: Notification) -> bool {
    match sink.try_send(notification) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(n)) => {
            tracing::warn!("알림 큐 가득 참, 버림: channel={}", n.channel);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
