//! 전송 페이로드

use std::path::Path;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::gif::{self, GifLimits, ValidationReport, Violation};
use crate::Result;

/// 페이로드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// 디스플레이 이미지 (GIF)
    Image,
    /// 펌웨어 이미지 (불투명 바이너리)
    Firmware,
}

/// 불변 페이로드
#[derive(Debug, Clone)]
pub struct Payload {
    kind: PayloadKind,
    data: Bytes,
}

impl Payload {
    pub fn image(data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadKind::Image,
            data: data.into(),
        }
    }

    pub fn firmware(data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadKind::Firmware,
            data: data.into(),
        }
    }

    /// 파일에서 읽기
    pub async fn load(path: impl AsRef<Path>, kind: PayloadKind) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        Ok(Self {
            kind,
            data: Bytes::from(data),
        })
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// SHA-256 다이제스트
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(&self.data).into()
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest())
    }

    /// 종류에 맞는 구조 검증. 펌웨어는 비어 있지만 않으면 통과
    pub fn validate(&self, limits: &GifLimits) -> ValidationReport {
        if self.data.is_empty() {
            return ValidationReport {
                violations: vec![Violation::Empty],
                ..ValidationReport::default()
            };
        }
        match self.kind {
            PayloadKind::Image => gif::validate(&self.data, limits),
            PayloadKind::Firmware => ValidationReport::default(),
        }
    }
}
