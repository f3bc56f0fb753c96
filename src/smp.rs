//! SMP 요청/응답 클라이언트
//!
//! - 시퀀스 번호 할당 (u8, wrapping)
//! - 응답은 에코된 시퀀스 번호로 매칭, 오래된 응답은 버림
//! - 여러 알림으로 쪼개진 응답 재조립

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cbor::{Fields, Value};
use crate::link::{Channel, Link, NotificationQueue};
use crate::packet::{self, command, group, OpKind, Packet, PacketBody, PacketHeader, HEADER_SIZE};
use crate::{Config, Error, Result};

/// SMP 응답
#[derive(Debug, Clone)]
pub struct SmpResponse {
    pub header: PacketHeader,
    pub body: PacketBody,
}

impl SmpResponse {
    pub fn fields(&self) -> Option<&Fields> {
        self.body.fields()
    }

    /// 결과 코드. 없으면 None (최신 펌웨어는 성공 시 rc를 생략)
    pub fn rc(&self) -> Option<i64> {
        self.fields()?.get("rc")?.as_i64()
    }

    /// 디바이스가 알려준 다음 오프셋
    pub fn offset(&self) -> Option<u64> {
        self.fields()?.get("off")?.as_u64()
    }

    /// rc가 있고 0이 아니면 에러
    pub fn check_rc(&self) -> Result<()> {
        match self.rc() {
            Some(code) if code != 0 => Err(Error::DeviceStatus { code }),
            _ => Ok(()),
        }
    }
}

/// 이미지 슬롯 상태
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSlot {
    pub image: u64,
    pub slot: u64,
    pub version: String,
    pub hash: Option<Bytes>,
    pub bootable: bool,
    pub pending: bool,
    pub confirmed: bool,
    pub active: bool,
    pub permanent: bool,
}

impl ImageSlot {
    fn from_fields(fields: &Fields) -> Self {
        let flag = |key: &str| fields.get(key).and_then(Value::as_bool).unwrap_or(false);
        Self {
            image: fields.get("image").and_then(Value::as_u64).unwrap_or(0),
            slot: fields.get("slot").and_then(Value::as_u64).unwrap_or(0),
            version: fields
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("?.?.?")
                .to_string(),
            hash: fields.get("hash").and_then(Value::as_bytes).cloned(),
            bootable: flag("bootable"),
            pending: flag("pending"),
            confirmed: flag("confirmed"),
            active: flag("active"),
            permanent: flag("permanent"),
        }
    }
}

/// 이미지 상태 응답에서 슬롯 목록 추출
pub fn parse_image_state(fields: &Fields) -> Vec<ImageSlot> {
    match fields.get("images") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Map(slot) => Some(ImageSlot::from_fields(slot)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn is_whole_packet(data: &[u8]) -> bool {
    matches!(packet::decode(data), Ok((_, rest)) if rest.is_empty())
}

/// SMP 클라이언트
pub struct SmpClient<L: Link> {
    link: Arc<L>,
    channel: Channel,
    queue: NotificationQueue,
    next_seq: u8,
    pending: BytesMut,
    timeout: Duration,
}

impl<L: Link> SmpClient<L> {
    /// SMP 채널 구독 후 클라이언트 생성
    pub async fn connect(link: Arc<L>, config: &Config) -> Result<Self> {
        let (tx, rx) = mpsc::channel(config.notify_queue_capacity);
        link.subscribe(config.smp_channel, tx).await?;

        Ok(Self {
            link,
            channel: config.smp_channel,
            queue: rx,
            next_seq: 0,
            pending: BytesMut::new(),
            timeout: config.response_timeout(),
        })
    }

    /// 다음 요청에 쓸 시퀀스 번호
    pub fn next_seq(&self) -> u8 {
        self.next_seq
    }

    /// 요청 한 번 보내고 응답 대기
    ///
    /// 재시도는 하지 않는다. 타임아웃은 `Error::Timeout`.
    pub async fn request(
        &mut self,
        op: OpKind,
        group: u16,
        command: u8,
        fields: &Fields,
    ) -> Result<SmpResponse> {
        let timeout = self.timeout;
        self.request_with_timeout(op, group, command, fields, timeout).await
    }

    pub async fn request_with_timeout(
        &mut self,
        op: OpKind,
        group: u16,
        command: u8,
        fields: &Fields,
        timeout: Duration,
    ) -> Result<SmpResponse> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let bytes = packet::encode(op, group, command, fields, seq)?;
        self.pending.clear();
        self.link.write(self.channel, &bytes, false).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notification = match tokio::time::timeout_at(deadline, self.queue.recv()).await {
                Ok(Some(n)) => n,
                Ok(None) => return Err(Error::Disconnected),
                Err(_) => {
                    warn!("SMP 응답 타임아웃: seq={}, group={}, cmd={}", seq, group, command);
                    return Err(Error::Timeout {
                        stage: "smp response",
                        offset: 0,
                    });
                }
            };

            // 단독으로 완결된 패킷이 오면 앞서 남은 조각은 버린다
            if !self.pending.is_empty() && is_whole_packet(&notification.data) {
                debug!("재조립 버퍼 폐기: {} bytes", self.pending.len());
                self.pending.clear();
            }
            self.pending.extend_from_slice(&notification.data);
            while let Some(packet) = self.take_packet() {
                if Self::matches(&packet.header, op, group, command, seq) {
                    return Ok(SmpResponse {
                        header: packet.header,
                        body: packet.body,
                    });
                }
                debug!(
                    "매칭되지 않는 SMP 응답 버림: seq={} (기다리는 seq={})",
                    packet.header.seq, seq
                );
            }
        }
    }

    /// 버퍼에 완성된 패킷이 있으면 꺼낸다
    fn take_packet(&mut self) -> Option<Packet> {
        if self.pending.len() < HEADER_SIZE {
            return None;
        }
        // 응답 op로 시작하지 않으면 SMP 프레임이 아니다
        let is_response = OpKind::from_u8(self.pending[0]).is_some_and(OpKind::is_response);
        if !is_response {
            debug!("SMP 프레임이 아닌 알림 버림: {} bytes", self.pending.len());
            self.pending.clear();
            return None;
        }
        match packet::decode(&self.pending) {
            Ok((packet, rest)) => {
                let consumed = self.pending.len() - rest.len();
                self.pending.advance(consumed);
                Some(packet)
            }
            // 나머지 조각 대기
            Err(_) => None,
        }
    }

    fn matches(header: &PacketHeader, op: OpKind, group: u16, command: u8, seq: u8) -> bool {
        header.op_kind() == Some(op.response())
            && header.group == group
            && header.command == command
            && header.seq == seq
    }

    /// 이미지 슬롯 상태 조회
    pub async fn image_state(&mut self) -> Result<Vec<ImageSlot>> {
        let response = self
            .request(OpKind::Read, group::IMAGE, command::IMAGE_STATE, &Fields::new())
            .await?;
        response.check_rc()?;
        Ok(response.fields().map(parse_image_state).unwrap_or_default())
    }

    /// 업로드한 이미지를 영구 확정
    pub async fn confirm_image(&mut self, hash: Option<&[u8]>) -> Result<Vec<ImageSlot>> {
        let mut fields = Fields::new().with("confirm", true);
        if let Some(hash) = hash {
            fields.insert("hash", hash);
        }
        let response = self
            .request(OpKind::Write, group::IMAGE, command::IMAGE_STATE, &fields)
            .await?;
        response.check_rc()?;
        info!("이미지 확정 완료");
        Ok(response.fields().map(parse_image_state).unwrap_or_default())
    }

    /// 디바이스 리셋
    pub async fn reset(&mut self) -> Result<()> {
        let response = self
            .request(OpKind::Write, group::OS, command::OS_RESET, &Fields::new())
            .await?;
        response.check_rc()?;
        info!("디바이스 리셋 요청 완료");
        Ok(())
    }
}
