//! 响应解码
//!
//! 读标签响应在偏移 50 处给出一字节数据类型码，数据从偏移 52 开始连续排列。
//! 元素个数 = floor(数据长度 / 步长)；只有一个元素时返回标量，否则返回数组。
//! 单字节与单字类型在线上按字对齐，步长为 2。

use crate::error::DecodeError;
use crate::frame::{ATTRIBUTE_DATA_INDEX, DATA_INDEX, DATA_TYPE_INDEX};
use domain::{AttributeCode, Value};

/// 线上数据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Text,
}

impl WireType {
    pub fn from_code(code: u8) -> Option<Self> {
        let wire_type = match code {
            0xC1 => WireType::Bool,
            0xC2 => WireType::Int8,
            0xC3 => WireType::Int16,
            0xC4 => WireType::Int32,
            0xC5 => WireType::Int64,
            0xC6 | 0xD1 => WireType::UInt8,
            0xC7 | 0xD2 => WireType::UInt16,
            0xC8 | 0xD3 => WireType::UInt32,
            0xC9 | 0xD4 => WireType::UInt64,
            0xCA => WireType::Float32,
            0xCB => WireType::Float64,
            0xD0 => WireType::Text,
            _ => return None,
        };
        Some(wire_type)
    }

    /// 每个元素占用的字节数。
    pub fn stride(self) -> usize {
        match self {
            WireType::Bool
            | WireType::Int8
            | WireType::UInt8
            | WireType::Int16
            | WireType::UInt16 => 2,
            WireType::Int32 | WireType::UInt32 | WireType::Float32 => 4,
            WireType::Int64 | WireType::UInt64 | WireType::Float64 => 8,
            WireType::Text => 1,
        }
    }

    fn read(self, chunk: &[u8]) -> Result<Value, DecodeError> {
        let value = match self {
            WireType::Bool => Value::Bool(le::<1>(chunk)?[0] & 1 == 1),
            WireType::Int8 => Value::Int(i64::from(i8::from_le_bytes(le::<1>(chunk)?))),
            WireType::Int16 => Value::Int(i64::from(i16::from_le_bytes(le::<2>(chunk)?))),
            WireType::Int32 => Value::Int(i64::from(i32::from_le_bytes(le::<4>(chunk)?))),
            WireType::Int64 => {
                let low = u32::from_le_bytes(le::<4>(chunk)?);
                let high = i32::from_le_bytes(le::<4>(&chunk[4..])?);
                Value::Int(join_i64(high, low))
            }
            WireType::UInt8 => Value::UInt(u64::from(le::<1>(chunk)?[0])),
            WireType::UInt16 => Value::UInt(u64::from(u16::from_le_bytes(le::<2>(chunk)?))),
            WireType::UInt32 => Value::UInt(u64::from(u32::from_le_bytes(le::<4>(chunk)?))),
            WireType::UInt64 => {
                let low = u32::from_le_bytes(le::<4>(chunk)?);
                let high = u32::from_le_bytes(le::<4>(&chunk[4..])?);
                Value::UInt((u64::from(high) << 32) | u64::from(low))
            }
            WireType::Float32 => Value::Float(f64::from(f32::from_le_bytes(le::<4>(chunk)?))),
            WireType::Float64 => Value::Float(f64::from_le_bytes(le::<8>(chunk)?)),
            WireType::Text => Value::Text(String::from_utf8_lossy(chunk).into_owned()),
        };
        Ok(value)
    }
}

/// 由两个 32 位半字拼出 64 位有符号整数。
///
/// 与 `high * 2^32 + low(有符号) + (low < 0 ? 2^32 : 0)` 等价，但按整数精确计算。
pub fn join_i64(high: i32, low: u32) -> i64 {
    (i64::from(high) << 32) | i64::from(low)
}

/// 解码读标签响应
pub fn decode_tag_value(frame: &[u8]) -> Result<Value, DecodeError> {
    let code = *frame.get(DATA_TYPE_INDEX).ok_or(DecodeError::Truncated {
        needed: DATA_TYPE_INDEX + 1,
        actual: frame.len(),
    })?;
    let wire_type = WireType::from_code(code).ok_or(DecodeError::UnknownType(code))?;
    let payload = frame.get(DATA_INDEX..).ok_or(DecodeError::Truncated {
        needed: DATA_INDEX,
        actual: frame.len(),
    })?;

    if wire_type == WireType::Text {
        return Ok(Value::Text(String::from_utf8_lossy(payload).into_owned()));
    }

    let stride = wire_type.stride();
    let count = payload.len() / stride;
    if count == 0 {
        return Err(DecodeError::Truncated {
            needed: DATA_INDEX + stride,
            actual: frame.len(),
        });
    }

    let mut items = payload
        .chunks_exact(stride)
        .map(|chunk| match wire_type {
            // 标量只看最低位，数组元素按整字节比较
            WireType::Bool if count > 1 => Ok(Value::Bool(chunk.first() == Some(&1))),
            _ => wire_type.read(chunk),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if count == 1 {
        Ok(items.remove(0))
    } else {
        Ok(Value::Array(items))
    }
}

/// 解码属性读取响应
pub fn decode_attribute(attribute: AttributeCode, frame: &[u8]) -> Result<Value, DecodeError> {
    let data = frame.get(ATTRIBUTE_DATA_INDEX..).unwrap_or_default();
    let truncated = |needed: usize| DecodeError::Truncated {
        needed: ATTRIBUTE_DATA_INDEX + needed,
        actual: frame.len(),
    };

    match attribute {
        AttributeCode::VendorId
        | AttributeCode::DeviceType
        | AttributeCode::ProductCode
        | AttributeCode::Status
        | AttributeCode::SerialNumber => {
            let raw = le::<2>(data).map_err(|_| truncated(2))?;
            Ok(Value::UInt(u64::from(u16::from_le_bytes(raw))))
        }
        AttributeCode::Revision => {
            let [major, minor] = le::<2>(data).map_err(|_| truncated(2))?;
            Ok(Value::Array(vec![
                Value::UInt(u64::from(major)),
                Value::UInt(u64::from(minor)),
            ]))
        }
        AttributeCode::ProductName => {
            if frame.len() < ATTRIBUTE_DATA_INDEX {
                return Err(truncated(0));
            }
            Ok(Value::Text(String::from_utf8_lossy(data).into_owned()))
        }
    }
}

fn le<const N: usize>(chunk: &[u8]) -> Result<[u8; N], DecodeError> {
    chunk
        .get(..N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeError::Truncated {
            needed: N,
            actual: chunk.len(),
        })
}
