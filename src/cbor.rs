//! 컴팩트 바이너리 맵 인코딩 (CBOR 부분집합, minicbor 기반)
//!
//! SMP 페이로드에 필요한 만큼만 지원한다:
//! 정수, 바이트열, 문자열, bool, null, 배열, 문자열 키 맵.
//! 부동소수, 태그, 길이 미정 항목은 거부한다.

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::encode::{self, Write};
use minicbor::{Decoder, Encode, Encoder};

/// 최대 중첩 깊이
const MAX_DEPTH: usize = 16;

/// 코덱 에러 (패킷 코덱 밖으로 나가지 않음)
#[derive(Debug, thiserror::Error)]
pub enum CborError {
    #[error("디코딩 실패: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("인코딩 실패: {0}")]
    Encode(String),
    #[error("지원하지 않는 타입: {0}")]
    Unsupported(Type),
    #[error("맵 키가 문자열이 아님")]
    NonTextKey,
    #[error("중첩이 너무 깊음")]
    TooDeep,
    #[error("뒤에 남은 바이트: {0}")]
    TrailingBytes(usize),
}

/// CBOR 값
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Unsigned(u64),
    /// 음수 (항상 < 0)
    Negative(i64),
    Bytes(Bytes),
    Text(String),
    Bool(bool),
    Null,
    Array(Vec<Value>),
    Map(Fields),
}

impl Value {
    /// 정수로 해석 (u64/i64 모두)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Unsigned(v) => i64::try_from(*v).ok(),
            Value::Negative(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Unsigned(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Unsigned(v as u64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Unsigned(v as u64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        if v < 0 {
            Value::Negative(v)
        } else {
            Value::Unsigned(v as u64)
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// 순서가 유지되는 문자열 키 맵
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    entries: Vec<(String, Value)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// 빌더 스타일 삽입
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// 키가 이미 있으면 값을 교체하고, 없으면 뒤에 추가
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<C> Encode<C> for Value {
    fn encode<W: Write>(&self, e: &mut Encoder<W>, ctx: &mut C) -> Result<(), encode::Error<W::Error>> {
        match self {
            Value::Unsigned(v) => {
                e.u64(*v)?;
            }
            Value::Negative(v) => {
                e.i64(*v)?;
            }
            Value::Bytes(b) => {
                e.bytes(b)?;
            }
            Value::Text(s) => {
                e.str(s)?;
            }
            Value::Bool(b) => {
                e.bool(*b)?;
            }
            Value::Null => {
                e.null()?;
            }
            Value::Array(items) => {
                e.array(items.len() as u64)?;
                for item in items {
                    item.encode(e, ctx)?;
                }
            }
            Value::Map(fields) => fields.encode(e, ctx)?,
        }
        Ok(())
    }
}

impl<C> Encode<C> for Fields {
    fn encode<W: Write>(&self, e: &mut Encoder<W>, ctx: &mut C) -> Result<(), encode::Error<W::Error>> {
        // 삽입 순서 그대로 쓴다
        e.map(self.entries.len() as u64)?;
        for (key, value) in &self.entries {
            e.str(key)?;
            value.encode(e, ctx)?;
        }
        Ok(())
    }
}

/// 맵을 인코딩
pub fn encode_fields(fields: &Fields) -> Result<Bytes, CborError> {
    minicbor::to_vec(fields)
        .map(Bytes::from)
        .map_err(|e| CborError::Encode(e.to_string()))
}

/// 맵 하나를 디코딩 (뒤에 남는 바이트가 있으면 에러)
pub fn decode_fields(input: &[u8]) -> Result<Fields, CborError> {
    let mut d = Decoder::new(input);
    let fields = match d.datatype()? {
        Type::Map => read_map(&mut d, 0)?,
        other => return Err(CborError::Unsupported(other)),
    };
    let rest = input.len() - d.position();
    if rest > 0 {
        return Err(CborError::TrailingBytes(rest));
    }
    Ok(fields)
}

fn read_map(d: &mut Decoder<'_>, depth: usize) -> Result<Fields, CborError> {
    let Some(len) = d.map()? else {
        return Err(CborError::Unsupported(Type::MapIndef));
    };
    let mut fields = Fields::new();
    for _ in 0..len {
        let key = match d.datatype()? {
            Type::String => d.str()?.to_string(),
            _ => return Err(CborError::NonTextKey),
        };
        let value = read_value(d, depth + 1)?;
        fields.insert(&key, value);
    }
    Ok(fields)
}

fn read_value(d: &mut Decoder<'_>, depth: usize) -> Result<Value, CborError> {
    if depth > MAX_DEPTH {
        return Err(CborError::TooDeep);
    }
    let value = match d.datatype()? {
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => Value::Unsigned(d.u64()?),
        Type::I8 | Type::I16 | Type::I32 | Type::I64 => Value::Negative(d.i64()?),
        Type::Bytes => Value::Bytes(Bytes::copy_from_slice(d.bytes()?)),
        Type::String => Value::Text(d.str()?.to_string()),
        Type::Bool => Value::Bool(d.bool()?),
        Type::Null => {
            d.null()?;
            Value::Null
        }
        Type::Array => {
            let Some(len) = d.array()? else {
                return Err(CborError::Unsupported(Type::ArrayIndef));
            };
            // 길이 필드만 믿고 미리 할당하지 않는다
            let mut items = Vec::with_capacity((len as usize).min(16));
            for _ in 0..len {
                items.push(read_value(d, depth + 1)?);
            }
            Value::Array(items)
        }
        Type::Map => Value::Map(read_map(d, depth)?),
        // 부동소수, 태그, 길이 미정, 큰 음수
        other => return Err(CborError::Unsupported(other)),
    };
    Ok(value)
}
