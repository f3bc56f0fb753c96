//! 전송 통계

use std::time::{Duration, Instant};

/// 단일 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 종료 시간 (종료 상태 도달 시)
    pub finish_time: Option<Instant>,

    /// 페이로드 크기
    pub payload_bytes: u64,

    /// 링크로 보낸 데이터 바이트 (재전송 포함)
    pub bytes_sent: u64,

    /// 보낸 청크 수 (재전송 포함)
    pub chunks_sent: u64,

    /// 쓰기 재시도 횟수
    pub write_retries: u64,

    /// 응답 타임아웃 횟수 (Framed)
    pub response_timeouts: u64,

    /// 디바이스가 되감아서 다시 보낸 청크 수 (Framed)
    pub retransmitted_chunks: u64,

    /// 받은 알림 수
    pub notifications: u64,
}

impl TransferStats {
    pub fn new(payload_bytes: usize) -> Self {
        Self {
            start_time: Instant::now(),
            finish_time: None,
            payload_bytes: payload_bytes as u64,
            bytes_sent: 0,
            chunks_sent: 0,
            write_retries: 0,
            response_timeouts: 0,
            retransmitted_chunks: 0,
            notifications: 0,
        }
    }

    /// 청크 전송 기록
    pub fn record_chunk(&mut self, size: usize) {
        self.chunks_sent += 1;
        self.bytes_sent += size as u64;
    }

    /// 종료 시각 기록
    pub fn finish(&mut self) {
        if self.finish_time.is_none() {
            self.finish_time = Some(Instant::now());
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        match self.finish_time {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// 처리율 (kbps)
    pub fn throughput_kbps(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        (self.bytes_sent as f64 * 8.0 / 1024.0) / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Bytes: {}/{} | Chunks: {} | Retries: {} | Rewinds: {} | Throughput: {:.1} kbps",
            self.elapsed().as_secs_f64(),
            self.bytes_sent,
            self.payload_bytes,
            self.chunks_sent,
            self.write_retries,
            self.retransmitted_chunks,
            self.throughput_kbps(),
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(0)
    }
}
