//! 标签路径编解码
//!
//! 文本形式：`seg[.seg]*`，每段可带 `[i]` 或 `[i,j]` 下标，例如 `varA[1].memC[2,300]`。
//!
//! 二进制形式（符号段）：
//!
//! ```text
//! 0x91 <len> <ascii...> [0x00 若长度为奇数]
//!   [0x28 <u8 index>]            下标 0..=255
//!   [0x29 0x00 <u16 LE index>]   下标 256..=65535
//! ```
//!
//! 所有段之后写入固定为 1 的元素个数（u16 LE）。

use crate::error::{DecodeError, PathError};
use std::fmt;
use std::str::FromStr;

pub const SYMBOL_SEGMENT: u8 = 0x91;
pub const ONE_BYTE_INDEX: u8 = 0x28;
pub const TWO_BYTE_INDEX: u8 = 0x29;

const MAX_INDICES: usize = 2;
const ELEMENT_COUNT: u16 = 1;

/// 单个路径段
#[derive(Debug, Clone, PartialEq, Eq)]
struct TagSegment {
    name: String,
    indices: Vec<u16>,
}

/// 已解析的标签路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPath {
    segments: Vec<TagSegment>,
}

impl TagPath {
    /// 写入符号段与元素个数，返回路径长度（16 位字，不含元素个数）。
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        for segment in &self.segments {
            buf.push(SYMBOL_SEGMENT);
            // 名称长度已在解析时限制为 u8 范围
            buf.push(segment.name.len() as u8);
            buf.extend_from_slice(segment.name.as_bytes());
            if segment.name.len() % 2 != 0 {
                buf.push(0x00);
            }
            for &index in &segment.indices {
                if index <= 0xFF {
                    buf.push(ONE_BYTE_INDEX);
                    buf.push(index as u8);
                } else {
                    buf.push(TWO_BYTE_INDEX);
                    buf.push(0x00);
                    buf.extend_from_slice(&index.to_le_bytes());
                }
            }
        }
        let words = (buf.len() - start) / 2;
        buf.extend_from_slice(&ELEMENT_COUNT.to_le_bytes());
        words
    }

    /// 从符号段字节还原路径（不含元素个数）。
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut segments = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            if bytes[pos] != SYMBOL_SEGMENT {
                return Err(DecodeError::MalformedPath(pos));
            }
            let len = *bytes.get(pos + 1).ok_or(DecodeError::MalformedPath(pos + 1))? as usize;
            let name_start = pos + 2;
            let name = bytes
                .get(name_start..name_start + len)
                .ok_or(DecodeError::MalformedPath(name_start))?;
            if !name.is_ascii() {
                return Err(DecodeError::MalformedPath(name_start));
            }
            pos = name_start + len + len % 2;

            let mut indices = Vec::new();
            while let Some(&code) = bytes.get(pos) {
                match code {
                    ONE_BYTE_INDEX => {
                        let index = *bytes.get(pos + 1).ok_or(DecodeError::MalformedPath(pos))?;
                        indices.push(u16::from(index));
                        pos += 2;
                    }
                    TWO_BYTE_INDEX => {
                        let raw = bytes
                            .get(pos + 2..pos + 4)
                            .ok_or(DecodeError::MalformedPath(pos))?;
                        indices.push(u16::from_le_bytes([raw[0], raw[1]]));
                        pos += 4;
                    }
                    _ => break,
                }
            }
            if indices.len() > MAX_INDICES {
                return Err(DecodeError::MalformedPath(pos));
            }

            segments.push(TagSegment {
                name: String::from_utf8_lossy(name).into_owned(),
                indices,
            });
        }

        if segments.is_empty() {
            return Err(DecodeError::MalformedPath(0));
        }
        Ok(Self { segments })
    }
}

impl FromStr for TagPath {
    type Err = PathError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        let segments = compact
            .split('.')
            .map(parse_segment)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }
}

fn parse_segment(raw: &str) -> Result<TagSegment, PathError> {
    let (name, indices) = match raw.find('[') {
        Some(open) => {
            if raw[..open].contains(']') {
                return Err(PathError::UnbalancedBrackets(raw.to_string()));
            }
            let inner = raw[open + 1..]
                .strip_suffix(']')
                .ok_or_else(|| PathError::UnbalancedBrackets(raw.to_string()))?;
            if inner.contains(['[', ']']) {
                return Err(PathError::UnbalancedBrackets(raw.to_string()));
            }
            let tokens: Vec<&str> = inner.split(',').collect();
            if tokens.len() > MAX_INDICES {
                return Err(PathError::TooManyIndices(raw.to_string()));
            }
            let indices = tokens
                .into_iter()
                .map(parse_index)
                .collect::<Result<Vec<_>, _>>()?;
            (&raw[..open], indices)
        }
        None if raw.contains(']') => return Err(PathError::UnbalancedBrackets(raw.to_string())),
        None => (raw, Vec::new()),
    };

    if name.is_empty() {
        return Err(PathError::EmptySegment);
    }
    if !name.is_ascii() {
        return Err(PathError::NonAscii(name.to_string()));
    }
    if name.len() > u8::MAX as usize {
        return Err(PathError::NameTooLong(name.len()));
    }

    Ok(TagSegment {
        name: name.to_string(),
        indices,
    })
}

fn parse_index(token: &str) -> Result<u16, PathError> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PathError::BadIndex(token.to_string()));
    }
    let value: u64 = token
        .parse()
        .map_err(|_| PathError::BadIndex(token.to_string()))?;
    u16::try_from(value).map_err(|_| PathError::IndexOutOfRange(value))
}

impl fmt::Display for TagPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&segment.name)?;
            if !segment.indices.is_empty() {
                let rendered: Vec<String> = segment.indices.iter().map(u16::to_string).collect();
                write!(f, "[{}]", rendered.join(","))?;
            }
        }
        Ok(())
    }
}
