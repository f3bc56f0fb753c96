//! MTU 기반 청크 분할
//!
//! - 청크 크기 = MTU - ATT 오버헤드 (3바이트), 최소 20바이트
//! - 분할은 지연 평가되고, 같은 입력이면 항상 같은 시퀀스를 낸다

use std::num::NonZeroUsize;

use crate::{ATT_OVERHEAD, MIN_CHUNK_SIZE};

/// 협상된 MTU에서 청크 크기 계산
///
/// 비정상적으로 작은 MTU여도 `MIN_CHUNK_SIZE` 아래로 내려가지 않는다.
pub fn chunk_size_for_mtu(mtu: usize) -> NonZeroUsize {
    let size = mtu.saturating_sub(ATT_OVERHEAD).max(MIN_CHUNK_SIZE);
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

/// 페이로드 조각
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// 페이로드 내 오프셋
    pub offset: usize,
    /// 데이터
    pub data: &'a [u8],
}

impl Chunk<'_> {
    /// 이 청크 다음 오프셋
    pub fn end(&self) -> usize {
        self.offset + self.data.len()
    }
}

/// 청크 분할기
#[derive(Debug, Clone, Copy)]
pub struct Chunker<'a> {
    payload: &'a [u8],
    chunk_size: NonZeroUsize,
}

impl<'a> Chunker<'a> {
    pub fn new(payload: &'a [u8], chunk_size: NonZeroUsize) -> Self {
        Self {
            payload,
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size.get()
    }

    /// 총 청크 수
    pub fn len(&self) -> usize {
        self.payload.len().div_ceil(self.chunk_size.get())
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// 처음부터 청크 시퀀스
    pub fn iter(&self) -> Chunks<'a> {
        Chunks {
            payload: self.payload,
            chunk_size: self.chunk_size.get(),
            offset: 0,
        }
    }

    /// 임의 오프셋에서 시작하는 청크 하나
    ///
    /// 디바이스가 알려준 오프셋에서 재개할 때 쓴다.
    pub fn chunk_at(&self, offset: usize) -> Option<Chunk<'a>> {
        if offset >= self.payload.len() {
            return None;
        }
        let end = (offset + self.chunk_size.get()).min(self.payload.len());
        Some(Chunk {
            offset,
            data: &self.payload[offset..end],
        })
    }
}

impl<'a> IntoIterator for &Chunker<'a> {
    type Item = Chunk<'a>;
    type IntoIter = Chunks<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// 청크 이터레이터
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    payload: &'a [u8],
    chunk_size: usize,
    offset: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.payload.len());
        let chunk = Chunk {
            offset: self.offset,
            data: &self.payload[self.offset..end],
        };
        self.offset = end;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.payload.len().saturating_sub(self.offset).div_ceil(self.chunk_size);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Chunks<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_chunk_size_for_mtu() {
        assert_eq!(chunk_size_for_mtu(247).get(), 244);
        assert_eq!(chunk_size_for_mtu(23).get(), 20);
        assert_eq!(chunk_size_for_mtu(10).get(), MIN_CHUNK_SIZE);
        assert_eq!(chunk_size_for_mtu(0).get(), MIN_CHUNK_SIZE);
    }

    #[test]
    fn test_concatenation_recovers_payload() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for s in [1, 2, 3, 7, 20, 244, 999, 1000, 1001, 5000] {
            let chunker = Chunker::new(&data, size(s));
            let chunks: Vec<_> = chunker.iter().collect();
            assert_eq!(chunks.len(), chunker.len());

            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
            assert_eq!(joined, data, "chunk size {}", s);

            let (last, rest) = chunks.split_last().unwrap();
            assert!(rest.iter().all(|c| c.data.len() == s));
            assert!(last.data.len() <= s && !last.data.is_empty());
        }
    }

    #[test]
    fn test_offsets_are_contiguous() {
        let data = vec![0u8; 2365];
        let chunker = Chunker::new(&data, size(244));
        let mut expected = 0;
        for chunk in &chunker {
            assert_eq!(chunk.offset, expected);
            expected = chunk.end();
        }
        assert_eq!(expected, data.len());
        assert_eq!(chunker.len(), 10);
        assert_eq!(chunker.iter().last().unwrap().data.len(), 169);
    }

    #[test]
    fn test_restartable() {
        let data: Vec<u8> = (0..50).collect();
        let chunker = Chunker::new(&data, size(8));
        let a: Vec<_> = chunker.iter().collect();
        let b: Vec<_> = chunker.iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_payload() {
        let chunker = Chunker::new(&[], size(20));
        assert!(chunker.is_empty());
        assert_eq!(chunker.iter().count(), 0);
        assert_eq!(chunker.chunk_at(0), None);
    }

    #[test]
    fn test_chunk_at_arbitrary_offset() {
        let data: Vec<u8> = (0..100).collect();
        let chunker = Chunker::new(&data, size(30));
        let chunk = chunker.chunk_at(85).unwrap();
        assert_eq!(chunk.data, &data[85..100]);
        let chunk = chunker.chunk_at(10).unwrap();
        assert_eq!(chunk.data, &data[10..40]);
        assert_eq!(chunker.chunk_at(100), None);
    }
}
