//! 전송 세션 (업로드 상태 머신)
//!
//! ```text
//! Idle → Handshaking → Streaming → AwaitingCompletion → {Completed | Failed | Unknown}
//! ```
//!
//! - 한 번에 하나의 청크만 전송 중 (파이프라인 없음)
//! - 모든 대기는 타임아웃이 있다
//! - 링크 끊김은 어느 상태에서든 Failed
//! - `upload` future를 drop하면 세션 포기. 이미 보낸 청크는 되돌리지 않는다

use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::cbor::{self, Fields};
use crate::gif::Violation;
use crate::chunk::{chunk_size_for_mtu, Chunk, Chunker};
use crate::link::{Channel, Link, Notification, NotificationQueue};
use crate::notify::{classify, notification_text, Classification};
use crate::packet::{command, group, OpKind, HEADER_SIZE};
use crate::payload::Payload;
use crate::smp::{SmpClient, SmpResponse};
use crate::stats::TransferStats;
use crate::{Config, Error, Result, MIN_CHUNK_SIZE};

/// 전송 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// 트리거 + 원시 바이트 스트림 (이미지)
    RawStream,
    /// SMP 패킷, 오프셋 기반 재개 (펌웨어)
    Framed,
}

/// 전송 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Handshaking,
    Streaming,
    AwaitingCompletion,
    Completed,
    Failed,
    Unknown,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Unknown
        )
    }
}

/// 분류된 디바이스 알림 (진단용)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    pub channel: Channel,
    pub classification: Classification,
    pub text: String,
}

/// 전송 결과
#[derive(Debug)]
pub enum TransferOutcome {
    Completed,
    Failed(Error),
    /// 완료 여부를 알 수 없음. 디바이스를 직접 확인해야 함
    Unknown,
}

/// 종료 보고서
#[derive(Debug)]
pub struct TransferReport {
    pub mode: TransferMode,
    pub state: TransferState,
    pub outcome: TransferOutcome,
    /// 마지막으로 확인된 오프셋
    pub last_offset: usize,
    pub total_len: usize,
    pub chunk_size: usize,
    /// ready 신호 수신 여부 (기다리지 않았으면 None)
    pub ready_signal: Option<bool>,
    pub evidence: Vec<Evidence>,
    pub stats: TransferStats,
}

impl TransferReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, TransferOutcome::Completed)
    }

    pub fn failure(&self) -> Option<&Error> {
        match &self.outcome {
            TransferOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// 스트리밍 종료 방식
enum Finish {
    Completed,
    Unknown,
}

/// 업로드 세션
pub struct TransferSession<L: Link> {
    link: Arc<L>,
    config: Config,
    backoff: BackoffPolicy,
    allow_invalid: bool,
    state: TransferState,
    offset: usize,
    chunk_size: usize,
    ready_signal: Option<bool>,
    evidence: Vec<Evidence>,
    stats: TransferStats,
}

impl<L: Link> TransferSession<L> {
    pub fn new(link: Arc<L>, config: Config) -> Self {
        Self {
            backoff: BackoffPolicy::from_config(&config),
            link,
            config,
            allow_invalid: false,
            state: TransferState::Idle,
            offset: 0,
            chunk_size: 0,
            ready_signal: None,
            evidence: Vec::new(),
            stats: TransferStats::default(),
        }
    }

    /// 검증 실패를 무시하고 전송 (--force)
    pub fn allow_invalid_payload(mut self, allow: bool) -> Self {
        self.allow_invalid = allow;
        self
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 페이로드 업로드
    ///
    /// 검증 실패(override 없음)만 `Err`로 돌려주고, 전송이 시작된 뒤의
    /// 결과는 모두 `TransferReport`에 담긴다.
    pub async fn upload(&mut self, payload: &Payload, mode: TransferMode) -> Result<TransferReport> {
        self.reset(payload.len());

        // 빈 페이로드는 강제 옵션과 무관하게 거부
        if payload.is_empty() {
            warn!("빈 페이로드, 전송하지 않음");
            return Err(Error::InvalidPayload {
                violations: vec![Violation::Empty],
            });
        }

        let validation = payload.validate(&self.config.gif_limits());
        if !validation.is_valid() {
            if !self.allow_invalid {
                warn!("페이로드 검증 실패: {:?}", validation.violations);
                return Err(Error::InvalidPayload {
                    violations: validation.violations,
                });
            }
            warn!("검증 실패 무시하고 전송: {:?}", validation.violations);
        }

        info!(
            "업로드 시작: {} bytes, mode={:?}, sha256={}",
            payload.len(),
            mode,
            &payload.digest_hex()[..16]
        );
        self.transition(TransferState::Handshaking);

        let result = match mode {
            TransferMode::RawStream => self.run_raw(payload).await,
            TransferMode::Framed => self.run_framed(payload).await,
        };

        let outcome = match result {
            Ok(Finish::Completed) => {
                self.transition(TransferState::Completed);
                info!("업로드 완료: {}", self.stats.summary());
                TransferOutcome::Completed
            }
            Ok(Finish::Unknown) => {
                self.transition(TransferState::Unknown);
                warn!("완료 알림 없음, 결과 불확실 (offset={})", self.offset);
                TransferOutcome::Unknown
            }
            Err(e) => {
                self.transition(TransferState::Failed);
                warn!("업로드 실패 (offset={}): {}", self.offset, e);
                TransferOutcome::Failed(e)
            }
        };
        self.stats.finish();

        Ok(TransferReport {
            mode,
            state: self.state,
            outcome,
            last_offset: self.offset,
            total_len: payload.len(),
            chunk_size: self.chunk_size,
            ready_signal: self.ready_signal,
            evidence: std::mem::take(&mut self.evidence),
            stats: self.stats.clone(),
        })
    }

    fn reset(&mut self, payload_len: usize) {
        self.state = TransferState::Idle;
        self.offset = 0;
        self.chunk_size = 0;
        self.ready_signal = None;
        self.evidence.clear();
        self.stats = TransferStats::new(payload_len);
    }

    fn transition(&mut self, next: TransferState) {
        debug!("상태 전이: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// MTU 협상 후 링크 쓰기 한 번에 들어가는 바이트 수
    async fn negotiate_chunk_size(&mut self) -> Result<NonZeroUsize> {
        let mtu = match self.link.negotiate_mtu().await {
            Ok(mtu) => mtu,
            Err(Error::Disconnected) => return Err(Error::Disconnected),
            Err(e) => {
                warn!("MTU 협상 실패, 기본값 {} 사용: {}", self.config.default_mtu, e);
                self.config.default_mtu
            }
        };
        let size = chunk_size_for_mtu(mtu);
        debug!("MTU {} -> 청크 {} bytes", mtu, size);
        Ok(size)
    }

    // ───────────────────────── RawStream ─────────────────────────

    async fn run_raw(&mut self, payload: &Payload) -> Result<Finish> {
        let chunk_size = self.negotiate_chunk_size().await?;
        self.chunk_size = chunk_size.get();
        let mut queue = self.subscribe_notifications().await?;

        let trigger = self.config.trigger.encode(payload.len())?;
        info!("트리거 전송: {} ({:?})", hex::encode(trigger), self.config.trigger);
        self.write_with_retry(
            self.config.trigger_channel,
            &trigger,
            self.config.trigger_needs_ack,
            0,
        )
        .await
        .map_err(|e| match e {
            Error::ChunkDeliveryFailed { attempts, .. } => Error::HandshakeFailed { attempts },
            other => other,
        })?;

        if self.config.wait_for_ready {
            self.wait_ready(&mut queue).await?;
        }

        self.transition(TransferState::Streaming);
        let chunker = Chunker::new(payload.data(), chunk_size);
        info!("스트리밍: {} chunks x {} bytes", chunker.len(), chunker.chunk_size());

        let mut early_complete = false;
        for chunk in chunker.iter() {
            self.offset = chunk.offset;
            self.write_with_retry(self.config.data_channel, chunk.data, false, chunk.offset)
                .await?;
            self.stats.record_chunk(chunk.data.len());
            self.offset = chunk.end();

            early_complete |= self.drain(&mut queue)?;
            sleep(self.config.chunk_interval()).await;
        }

        self.transition(TransferState::AwaitingCompletion);
        if early_complete {
            return Ok(Finish::Completed);
        }
        self.await_completion(&mut queue).await
    }

    /// 알림 채널 구독. 세션이 유일한 소비자
    async fn subscribe_notifications(&self) -> Result<NotificationQueue> {
        let (tx, rx) = mpsc::channel(self.config.notify_queue_capacity);

        let mut channels = self.config.notify_channels.clone();
        if self.config.wait_for_ready && !channels.contains(&self.config.trigger_channel) {
            channels.push(self.config.trigger_channel);
        }
        for channel in channels {
            self.link.subscribe(channel, tx.clone()).await?;
        }
        Ok(rx)
    }

    /// 쓰기 + 백오프 재시도
    async fn write_with_retry(
        &mut self,
        channel: Channel,
        data: &[u8],
        needs_ack: bool,
        offset: usize,
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.link.write(channel, data, needs_ack).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    if self.backoff.exhausted(attempt) {
                        warn!("쓰기 재시도 한도 초과: offset={}, {}회", offset, attempt);
                        return Err(Error::ChunkDeliveryFailed {
                            offset,
                            attempts: attempt,
                        });
                    }
                    let delay = self.backoff.delay(attempt);
                    self.stats.write_retries += 1;
                    warn!(
                        "쓰기 실패 (offset={}, {}/{}), {:?} 후 재시도: {}",
                        offset, attempt, self.backoff.max_retries, delay, e
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 알림 하나를 분류하고 증거로 기록
    fn observe(&mut self, notification: &Notification) -> Classification {
        let classification = classify(&notification.data);
        let text = match classification {
            Classification::ReadySignal => hex::encode(&notification.data),
            _ => notification_text(&notification.data),
        };
        debug!(
            "알림 [{}] {}: {:?}",
            notification.channel, classification, text
        );

        self.stats.notifications += 1;
        self.evidence.push(Evidence {
            channel: notification.channel,
            classification,
            text,
        });
        classification
    }

    fn last_evidence_text(&self) -> String {
        self.evidence
            .last()
            .map(|e| e.text.clone())
            .unwrap_or_default()
    }

    /// ready 신호 대기. 없어도 실패가 아니다
    async fn wait_ready(&mut self, queue: &mut NotificationQueue) -> Result<()> {
        let deadline = Instant::now() + self.config.ready_timeout();
        loop {
            match timeout_at(deadline, queue.recv()).await {
                Ok(Some(notification)) => match self.observe(&notification) {
                    Classification::ReadySignal => {
                        info!("Device ready");
                        self.ready_signal = Some(true);
                        return Ok(());
                    }
                    Classification::Failed => {
                        return Err(Error::DeviceReportedFailure {
                            message: self.last_evidence_text(),
                        });
                    }
                    _ => {}
                },
                Ok(None) => return Err(Error::Disconnected),
                Err(_) => {
                    warn!(
                        "ready 신호 없음 ({}ms), 계속 진행 (신뢰도 낮음)",
                        self.config.ready_timeout_ms
                    );
                    self.ready_signal = Some(false);
                    return Ok(());
                }
            }
        }
    }

    /// 스트리밍 중 쌓인 알림 처리. 완료 알림이 있었으면 true
    fn drain(&mut self, queue: &mut NotificationQueue) -> Result<bool> {
        let mut complete = false;
        loop {
            match queue.try_recv() {
                Ok(notification) => match self.observe(&notification) {
                    Classification::Failed => {
                        return Err(Error::DeviceReportedFailure {
                            message: self.last_evidence_text(),
                        });
                    }
                    Classification::Complete => complete = true,
                    _ => {}
                },
                Err(TryRecvError::Empty) => return Ok(complete),
                Err(TryRecvError::Disconnected) => return Err(Error::Disconnected),
            }
        }
    }

    /// 완료 알림 대기
    async fn await_completion(&mut self, queue: &mut NotificationQueue) -> Result<Finish> {
        let deadline = Instant::now() + self.config.completion_wait();
        loop {
            match timeout_at(deadline, queue.recv()).await {
                Ok(Some(notification)) => match self.observe(&notification) {
                    Classification::Complete => return Ok(Finish::Completed),
                    Classification::Failed => {
                        return Err(Error::DeviceReportedFailure {
                            message: self.last_evidence_text(),
                        });
                    }
                    _ => {}
                },
                Ok(None) => return Err(Error::Disconnected),
                Err(_) => return Ok(Finish::Unknown),
            }
        }
    }

    // ───────────────────────── Framed ─────────────────────────

    async fn run_framed(&mut self, payload: &Payload) -> Result<Finish> {
        let write_budget = self.negotiate_chunk_size().await?;
        let mut smp = SmpClient::connect(self.link.clone(), &self.config).await?;

        let total = payload.len();
        let digest = payload.digest();
        // 쓰기 한도가 필드보다 작아도 청크는 최소 크기 아래로 줄이지 않는다
        let budget = framed_data_budget(write_budget.get(), total, &digest, self.config.image_slot)?
            .min(self.config.framed_chunk_limit)
            .max(MIN_CHUNK_SIZE);
        let chunk_size = NonZeroUsize::new(budget).unwrap_or(NonZeroUsize::MIN);
        self.chunk_size = chunk_size.get();

        // 별도 핸드쉐이크 없음: 첫 청크가 len/sha를 함께 실어 세션을 연다
        self.transition(TransferState::Streaming);
        let chunker = Chunker::new(payload.data(), chunk_size);
        info!("SMP 업로드: {} bytes, 청크 {} bytes", total, chunk_size);

        let mut offset = 0usize;
        let mut stalls = 0u32;
        while let Some(chunk) = chunker.chunk_at(offset) {
            self.offset = offset;
            let fields = upload_fields(self.config.image_slot, chunk, total, &digest);
            let response = self.request_chunk(&mut smp, &fields, offset).await?;
            self.stats.record_chunk(chunk.data.len());

            if let Some(code) = response.rc() {
                if code != 0 {
                    return Err(Error::DeviceRejectedChunk { code, offset });
                }
            }

            // 디바이스 오프셋이 기준. 없으면 로컬 예상값
            let next = match response.offset() {
                Some(off) => usize::try_from(off).unwrap_or(usize::MAX),
                None => chunk.end(),
            };
            if next > total {
                return Err(Error::UnexpectedOffset {
                    offset: next,
                    total,
                });
            }

            if next <= offset {
                stalls += 1;
                self.stats.retransmitted_chunks += 1;
                warn!("디바이스가 오프셋 되감음: {} -> {} ({}회 연속)", offset, next, stalls);
                if stalls > self.backoff.max_retries {
                    return Err(Error::ChunkDeliveryFailed {
                        offset,
                        attempts: stalls,
                    });
                }
            } else {
                stalls = 0;
                if next != chunk.end() {
                    debug!("디바이스 오프셋 {} (예상 {})", next, chunk.end());
                }
            }

            offset = next;
            self.offset = offset;
            if offset < total {
                sleep(self.config.framed_interval()).await;
            }
        }

        self.transition(TransferState::AwaitingCompletion);
        info!("디바이스가 전체 {} bytes 수신 확인", total);
        Ok(Finish::Completed)
    }

    /// 업로드 요청 하나를 응답까지 재시도
    async fn request_chunk(
        &mut self,
        smp: &mut SmpClient<L>,
        fields: &Fields,
        offset: usize,
    ) -> Result<SmpResponse> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let failure = match smp
                .request(OpKind::Write, group::IMAGE, command::IMAGE_UPLOAD, fields)
                .await
            {
                Ok(response) => {
                    if response.fields().is_some() {
                        return Ok(response);
                    }
                    warn!("해석할 수 없는 업로드 응답: seq={}", response.header.seq);
                    None
                }
                Err(e) if e.is_transient() => Some(e),
                Err(e) => return Err(e),
            };

            if matches!(failure, Some(Error::Timeout { .. })) {
                self.stats.response_timeouts += 1;
            }
            if self.backoff.exhausted(attempt) {
                return Err(match failure {
                    Some(Error::Timeout { stage, .. }) => Error::Timeout { stage, offset },
                    _ => Error::ChunkDeliveryFailed {
                        offset,
                        attempts: attempt,
                    },
                });
            }

            let delay = self.backoff.delay(attempt);
            self.stats.write_retries += 1;
            warn!(
                "청크 요청 실패 (offset={}, {}/{}), {:?} 후 재시도",
                offset, attempt, self.backoff.max_retries, delay
            );
            sleep(delay).await;
        }
    }
}

/// 업로드 요청 필드. 첫 청크에만 len/sha
fn upload_fields(slot: u32, chunk: Chunk<'_>, total: usize, digest: &[u8; 32]) -> Fields {
    let mut fields = Fields::new()
        .with("image", slot)
        .with("off", chunk.offset)
        .with("data", chunk.data);
    if chunk.offset == 0 {
        fields.insert("len", total);
        fields.insert("sha", &digest[..]);
    }
    fields
}

/// 링크 쓰기 한 번에 들어가는 청크 데이터 크기
///
/// 헤더와 필드(첫 청크 기준)를 빼고, data 길이 접두사 증가분 2바이트를 남긴다.
fn framed_data_budget(
    write_budget: usize,
    total: usize,
    digest: &[u8; 32],
    slot: u32,
) -> Result<usize> {
    let first = upload_fields(
        slot,
        Chunk {
            offset: 0,
            data: &[],
        },
        total,
        digest,
    )
    .with("off", total);
    let overhead = HEADER_SIZE + cbor::encode_fields(&first)?.len() + 2;
    Ok(write_budget.saturating_sub(overhead))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gif::tests::build_gif;
    use crate::link::testing::{ScriptedLink, WriteRecord};
    use crate::packet;
    use crate::{DEFAULT_MTU, READY_SIGNAL};

    const GIF_LEN: usize = 2365;

    fn link_error() -> Error {
        Error::LinkWriteFailed {
            channel: Channel::Data,
            reason: "GATT busy".into(),
        }
    }

    /// ready 신호와 완료 알림을 보내는 원시 스트림 디바이스
    fn raw_device(total: usize) -> impl FnMut(&WriteRecord, usize) -> Vec<Notification> + Send {
        let mut received = 0usize;
        move |record: &WriteRecord, _| match record.channel {
            Channel::Trigger => vec![Notification::new(Channel::Trigger, READY_SIGNAL.to_vec())],
            Channel::Data => {
                received += record.data.len();
                if received == total {
                    vec![Notification::new(Channel::Status, &b"Transfer Complete"[..])]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn request_fields(record: &WriteRecord) -> Fields {
        let (packet, _) = packet::decode(&record.data).unwrap();
        packet.body.fields().cloned().unwrap()
    }

    fn request_offset(record: &WriteRecord) -> usize {
        request_fields(record).get("off").unwrap().as_u64().unwrap() as usize
    }

    fn smp_reply(record: &WriteRecord, fields: Fields) -> Notification {
        let (request, _) = packet::decode(&record.data).unwrap();
        let bytes = packet::encode(
            OpKind::WriteResponse,
            request.header.group,
            request.header.command,
            &fields,
            request.header.seq,
        )
        .unwrap();
        Notification::new(Channel::Smp, bytes)
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_stream_completes() {
        let gif = build_gif(64, 64, GIF_LEN);
        let link = ScriptedLink::with_responder(247, raw_device(GIF_LEN));
        let mut session = TransferSession::new(link.clone(), Config::default());

        let report = session
            .upload(&Payload::image(gif.clone()), TransferMode::RawStream)
            .await
            .unwrap();

        assert!(report.is_completed(), "{:?}", report.outcome);
        assert_eq!(report.state, TransferState::Completed);
        assert_eq!(session.state(), TransferState::Completed);
        assert_eq!(report.chunk_size, 244);
        assert_eq!(report.ready_signal, Some(true));
        assert_eq!(report.last_offset, GIF_LEN);

        let trigger = link.writes_on(Channel::Trigger);
        assert_eq!(trigger.len(), 1);
        assert_eq!(trigger[0].data, (GIF_LEN as u32).to_le_bytes().to_vec());
        assert!(trigger[0].needs_ack);

        let data = link.writes_on(Channel::Data);
        let sizes: Vec<usize> = data.iter().map(|w| w.data.len()).collect();
        assert_eq!(sizes.len(), 10);
        assert!(sizes[..9].iter().all(|&s| s == 244));
        assert_eq!(sizes[9], 169);
        assert!(data.iter().all(|w| !w.needs_ack));

        let joined: Vec<u8> = data.iter().flat_map(|w| w.data.clone()).collect();
        assert_eq!(joined, gif);
        assert_eq!(report.stats.chunks_sent, 10);
        assert!(report
            .evidence
            .iter()
            .any(|e| e.classification == Classification::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ready_signal_is_not_fatal() {
        let mut device = raw_device(GIF_LEN);
        let link = ScriptedLink::with_responder(247, move |record: &WriteRecord, index| {
            if record.channel == Channel::Trigger {
                return Vec::new();
            }
            device(record, index)
        });
        let mut session = TransferSession::new(link.clone(), Config::default());

        let report = session
            .upload(&Payload::image(build_gif(64, 64, GIF_LEN)), TransferMode::RawStream)
            .await
            .unwrap();

        assert_eq!(report.ready_signal, Some(false));
        assert!(report.is_completed());
        assert_eq!(link.writes_on(Channel::Data).len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_is_unknown() {
        let link = ScriptedLink::new(247);
        let config = Config::single_channel();
        let mut session = TransferSession::new(link, config);

        let report = session
            .upload(&Payload::image(build_gif(64, 64, 500)), TransferMode::RawStream)
            .await
            .unwrap();

        assert!(matches!(report.outcome, TransferOutcome::Unknown));
        assert_eq!(report.state, TransferState::Unknown);
        assert_eq!(report.ready_signal, None);
        assert_eq!(report.last_offset, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecognized_notifications_stay_unknown() {
        let link = ScriptedLink::with_responder(247, |record: &WriteRecord, _| {
            if record.channel == Channel::Data {
                vec![Notification::new(Channel::Response, &b"\x01\x02"[..])]
            } else {
                Vec::new()
            }
        });
        let mut session = TransferSession::new(link, Config::single_channel());

        let report = session
            .upload(&Payload::image(build_gif(64, 64, 100)), TransferMode::RawStream)
            .await
            .unwrap();

        assert!(matches!(report.outcome, TransferOutcome::Unknown));
        assert!(!report.evidence.is_empty());
        assert!(report
            .evidence
            .iter()
            .all(|e| e.classification == Classification::Unknown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_failure_notification() {
        let link = ScriptedLink::with_responder(247, |record: &WriteRecord, _| match record.channel {
            Channel::Trigger => vec![Notification::new(Channel::Trigger, READY_SIGNAL.to_vec())],
            Channel::Data => vec![Notification::new(Channel::Status, &b"Image validation FAILED"[..])],
            _ => Vec::new(),
        });
        let mut session = TransferSession::new(link.clone(), Config::default());

        let report = session
            .upload(&Payload::image(build_gif(64, 64, GIF_LEN)), TransferMode::RawStream)
            .await
            .unwrap();

        match report.failure() {
            Some(Error::DeviceReportedFailure { message }) => {
                assert_eq!(message, "Image validation FAILED")
            }
            other => panic!("unexpected {:?}", other),
        }
        // 첫 청크 직후 중단
        assert_eq!(link.writes_on(Channel::Data).len(), 1);
        assert_eq!(report.last_offset, 244);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cap_exhausted_reports_offset() {
        let mut data_attempts = 0;
        let link = ScriptedLink::with_plan(
            247,
            raw_device(GIF_LEN),
            move |record: &WriteRecord, _| {
                if record.channel != Channel::Data {
                    return None;
                }
                data_attempts += 1;
                (data_attempts > 3).then(link_error)
            },
        );
        let mut session = TransferSession::new(link.clone(), Config::default());

        let report = session
            .upload(&Payload::image(build_gif(64, 64, GIF_LEN)), TransferMode::RawStream)
            .await
            .unwrap();

        assert_eq!(report.state, TransferState::Failed);
        assert!(matches!(
            report.failure(),
            Some(Error::ChunkDeliveryFailed {
                offset: 732,
                attempts: 5
            })
        ));
        assert_eq!(report.last_offset, 732);
        // 트리거 1 + 성공 3 + 실패 5
        assert_eq!(link.attempts(), 9);
        assert_eq!(report.stats.write_retries, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let mut data_attempts = 0;
        let link = ScriptedLink::with_plan(
            247,
            raw_device(GIF_LEN),
            move |record: &WriteRecord, _| {
                if record.channel != Channel::Data {
                    return None;
                }
                data_attempts += 1;
                matches!(data_attempts, 2 | 3).then(link_error)
            },
        );
        let mut session = TransferSession::new(link.clone(), Config::default());

        let report = session
            .upload(&Payload::image(build_gif(64, 64, GIF_LEN)), TransferMode::RawStream)
            .await
            .unwrap();

        assert!(report.is_completed());
        assert_eq!(report.stats.write_retries, 2);
        assert_eq!(link.writes_on(Channel::Data).len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_fails_immediately() {
        let link = ScriptedLink::with_plan(
            247,
            raw_device(GIF_LEN),
            |record: &WriteRecord, _| (record.channel == Channel::Data).then_some(Error::Disconnected),
        );
        let mut session = TransferSession::new(link.clone(), Config::default());

        let report = session
            .upload(&Payload::image(build_gif(64, 64, GIF_LEN)), TransferMode::RawStream)
            .await
            .unwrap();

        assert!(matches!(report.failure(), Some(Error::Disconnected)));
        assert_eq!(link.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_gif_rejected_unless_forced() {
        let mut gif = build_gif(64, 64, GIF_LEN);
        let last = gif.len() - 1;
        gif[last] = 0x00;
        let payload = Payload::image(gif);

        let link = ScriptedLink::with_responder(247, raw_device(GIF_LEN));
        let mut session = TransferSession::new(link.clone(), Config::default());
        match session.upload(&payload, TransferMode::RawStream).await {
            Err(Error::InvalidPayload { violations }) => {
                assert!(violations.contains(&Violation::TruncatedFile { trailer: 0x00 }))
            }
            other => panic!("unexpected {:?}", other.map(|r| r.outcome)),
        }
        assert_eq!(link.attempts(), 0);

        let mut session = TransferSession::new(link.clone(), Config::default()).allow_invalid_payload(true);
        let report = session.upload(&payload, TransferMode::RawStream).await.unwrap();
        assert!(report.is_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_captured_trigger_profile() {
        let link = ScriptedLink::with_responder(247, raw_device(GIF_LEN));
        let mut session = TransferSession::new(link.clone(), Config::captured_command());
        session
            .upload(&Payload::image(build_gif(64, 64, GIF_LEN)), TransferMode::RawStream)
            .await
            .unwrap();

        let trigger = link.writes_on(Channel::Trigger);
        assert_eq!(trigger[0].data, vec![0x00, 0x40, 0x10, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_framed_resumes_from_device_offset() {
        let firmware: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut requests = 0;
        let link = ScriptedLink::with_responder(247, move |record: &WriteRecord, _| {
            if record.channel != Channel::Smp {
                return Vec::new();
            }
            requests += 1;
            let fields = request_fields(record);
            let off = fields.get("off").unwrap().as_u64().unwrap();
            let len = fields.get("data").unwrap().as_bytes().unwrap().len() as u64;
            // 세 번째 응답은 이전 청크 오프셋으로 되감는다
            let next = if requests == 3 { off - len } else { off + len };
            vec![smp_reply(record, Fields::new().with("rc", 0u32).with("off", next))]
        });
        let mut session = TransferSession::new(link.clone(), Config::default());

        let report = session
            .upload(&Payload::firmware(firmware.clone()), TransferMode::Framed)
            .await
            .unwrap();

        assert!(report.is_completed(), "{:?}", report.outcome);
        assert_eq!(report.chunk_size, 128);
        assert_eq!(report.last_offset, 1000);
        assert_eq!(report.stats.retransmitted_chunks, 1);

        let writes = link.writes_on(Channel::Smp);
        let offsets: Vec<usize> = writes.iter().map(request_offset).collect();
        assert_eq!(offsets, vec![0, 128, 256, 128, 256, 384, 512, 640, 768, 896]);

        // 세 번째 청크 범위 재전송
        let resent = request_fields(&writes[4]);
        assert_eq!(
            &resent.get("data").unwrap().as_bytes().unwrap()[..],
            &firmware[256..384]
        );

        // len/sha는 첫 청크에만
        let first = request_fields(&writes[0]);
        assert_eq!(first.get("len").unwrap().as_u64(), Some(1000));
        assert_eq!(
            &first.get("sha").unwrap().as_bytes().unwrap()[..],
            &Payload::firmware(firmware.clone()).digest()[..]
        );
        assert!(request_fields(&writes[1]).get("sha").is_none());
        assert!(writes.iter().all(|w| w.data.len() <= 244));
    }

    #[tokio::test(start_paused = true)]
    async fn test_framed_sequence_numbers_echoed() {
        let link = ScriptedLink::with_responder(247, |record: &WriteRecord, _| {
            let fields = request_fields(record);
            let off = fields.get("off").unwrap().as_u64().unwrap();
            let len = fields.get("data").unwrap().as_bytes().unwrap().len() as u64;
            vec![smp_reply(record, Fields::new().with("off", off + len))]
        });
        let mut session = TransferSession::new(link.clone(), Config::default());
        let report = session
            .upload(&Payload::firmware(vec![1u8; 600]), TransferMode::Framed)
            .await
            .unwrap();

        // rc 없는 응답은 성공
        assert!(report.is_completed());
        let seqs: Vec<u8> = link.writes_on(Channel::Smp).iter().map(|w| w.data[6]).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_framed_chunk_floor_at_default_mtu() {
        let link = ScriptedLink::with_responder(DEFAULT_MTU, |record: &WriteRecord, _| {
            let fields = request_fields(record);
            let off = fields.get("off").unwrap().as_u64().unwrap();
            let len = fields.get("data").unwrap().as_bytes().unwrap().len() as u64;
            vec![smp_reply(record, Fields::new().with("rc", 0u32).with("off", off + len))]
        });
        let mut session = TransferSession::new(link.clone(), Config::default());

        let report = session
            .upload(&Payload::firmware(vec![3u8; 200]), TransferMode::Framed)
            .await
            .unwrap();

        assert!(report.is_completed(), "{:?}", report.outcome);
        assert!(report.chunk_size >= MIN_CHUNK_SIZE, "chunk {}", report.chunk_size);
        let writes = link.writes_on(Channel::Smp);
        assert_eq!(writes.len(), 200 / report.chunk_size);
        let offsets: Vec<usize> = writes.iter().map(request_offset).collect();
        assert_eq!(offsets[1], report.chunk_size);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload_rejected_even_when_forced() {
        let link = ScriptedLink::with_responder(247, raw_device(0));

        for (payload, mode) in [
            (Payload::firmware(Vec::new()), TransferMode::Framed),
            (Payload::image(Vec::new()), TransferMode::RawStream),
        ] {
            let mut session =
                TransferSession::new(link.clone(), Config::default()).allow_invalid_payload(true);
            match session.upload(&payload, mode).await {
                Err(Error::InvalidPayload { violations }) => {
                    assert_eq!(violations, vec![Violation::Empty]);
                }
                other => panic!("unexpected {:?}", other.map(|r| r.outcome)),
            }
            assert_eq!(session.state(), TransferState::Idle);
        }
        assert_eq!(link.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_framed_device_rejection() {
        let link = ScriptedLink::with_responder(247, |record: &WriteRecord, _| {
            let off = request_offset(record) as u64;
            let rc = if off >= 256 { 6u32 } else { 0 };
            vec![smp_reply(record, Fields::new().with("rc", rc).with("off", off + 128))]
        });
        let mut session = TransferSession::new(link, Config::default());

        let report = session
            .upload(&Payload::firmware(vec![0u8; 1000]), TransferMode::Framed)
            .await
            .unwrap();

        assert!(matches!(
            report.failure(),
            Some(Error::DeviceRejectedChunk { code: 6, offset: 256 })
        ));
        assert_eq!(report.last_offset, 256);
    }

    #[tokio::test(start_paused = true)]
    async fn test_framed_timeout_after_retry_cap() {
        let link = ScriptedLink::new(247);
        let mut session = TransferSession::new(link.clone(), Config::default());

        let report = session
            .upload(&Payload::firmware(vec![0u8; 300]), TransferMode::Framed)
            .await
            .unwrap();

        assert!(matches!(report.failure(), Some(Error::Timeout { offset: 0, .. })));
        assert_eq!(link.writes_on(Channel::Smp).len(), 5);
        assert_eq!(report.stats.response_timeouts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_framed_offset_beyond_payload() {
        let link = ScriptedLink::with_responder(247, |record: &WriteRecord, _| {
            vec![smp_reply(record, Fields::new().with("rc", 0u32).with("off", 5000u32))]
        });
        let mut session = TransferSession::new(link, Config::default());

        let report = session
            .upload(&Payload::firmware(vec![0u8; 300]), TransferMode::Framed)
            .await
            .unwrap();

        assert!(matches!(
            report.failure(),
            Some(Error::UnexpectedOffset { offset: 5000, total: 300 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_framed_stuck_device_gives_up() {
        let link = ScriptedLink::with_responder(247, |record: &WriteRecord, _| {
            vec![smp_reply(record, Fields::new().with("rc", 0u32).with("off", 0u32))]
        });
        let mut session = TransferSession::new(link.clone(), Config::default());

        let report = session
            .upload(&Payload::firmware(vec![0u8; 300]), TransferMode::Framed)
            .await
            .unwrap();

        assert!(matches!(
            report.failure(),
            Some(Error::ChunkDeliveryFailed { offset: 0, attempts: 6 })
        ));
        assert_eq!(link.writes_on(Channel::Smp).len(), 6);
    }

    #[test]
    fn test_framed_budget_fits_write() {
        let digest = [0u8; 32];
        let budget = framed_data_budget(244, 100_000, &digest, 0).unwrap();
        let data = vec![0u8; budget];
        let fields = upload_fields(0, Chunk { offset: 0, data: &data }, 100_000, &digest).with("off", 99_999u32);
        let encoded = crate::packet::encode(OpKind::Write, group::IMAGE, command::IMAGE_UPLOAD, &fields, 0).unwrap();
        assert!(encoded.len() <= 244, "{} > 244", encoded.len());
    }
}
