//! 封装帧编码
//!
//! 四种请求帧都来自静态模板，只在固定偏移处写入会话句柄、连接 ID、序列号、
//! 属性号与长度字段。所有多字节字段均为小端。

use crate::error::{DecodeError, EncodeError};
use crate::tag_path::TagPath;
use bytes::Bytes;
use domain::AttributeCode;
use std::fmt;

pub const HEADER_LEN_INDEX: usize = 2;
pub const SESSION_HANDLE_INDEX: usize = 4;
pub const RESPONSE_STATUS_INDEX: usize = 8;
pub const CONNECTION_ID_CMD_INDEX: usize = 36;
pub const DATA_LEN_INDEX: usize = 42;
pub const CONNECTION_ERROR_INDEX: usize = 42;
pub const SEQUENCE_COUNT_INDEX: usize = 44;
pub const CONNECTION_ID_RESP_INDEX: usize = 44;
pub const SERVICE_CODE_INDEX: usize = 46;
pub const PATH_LEN_INDEX: usize = 47;
pub const ATTRIBUTE_DATA_INDEX: usize = 50;
pub const DATA_TYPE_INDEX: usize = 50;
pub const DATA_INDEX: usize = 52;
pub const ATTRIBUTE_ID_INDEX: usize = 53;
pub const ENCAPSULATION_HEADER_SIZE: usize = 24;
pub const MAX_FRAME_SIZE: usize = 1024;

pub const REGISTER_SESSION_CMD: u8 = 0x65;
pub const SEND_RR_DATA_CMD: u8 = 0x6F;
pub const SEND_UNIT_DATA_CMD: u8 = 0x70;
pub const SERVICE_READ_TAG: u8 = 0x4C;
pub const SERVICE_GET_ATTRIBUTE_SINGLE: u8 = 0x0E;

/// 序列号初值（每次断开后复位）
pub const INITIAL_SEQUENCE_COUNT: u16 = 6;

const REGISTER_SESSION_TEMPLATE: [u8; 28] = [
    0x65, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
];

const CONNECT_TEMPLATE: [u8; 92] = [
    0x6f, 0x00, 0x44, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x3f, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00,
    0x00, 0x00, 0x00, 0x00, 0xb2, 0x00, 0x34, 0x00, 0x5b, 0x02, 0x20, 0x06, 0x24, 0x01, 0x06, 0x9c,
    0x02, 0x00, 0x00, 0x80, 0x01, 0x00, 0xfe, 0x80, 0x02, 0x00, 0x1b, 0x05, 0xd0, 0xbe, 0xfe, 0x03,
    0x02, 0x00, 0x00, 0x00, 0x80, 0x84, 0x1e, 0x00, 0xcc, 0x07, 0x00, 0x42, 0x80, 0x84, 0x1e, 0x00,
    0xcc, 0x07, 0x00, 0x42, 0xa3, 0x03, 0x20, 0x02, 0x24, 0x01, 0x2c, 0x01,
];

const READ_ATTRIBUTE_TEMPLATE: [u8; 54] = [
    0x70, 0x00, 0x1e, 0x00, 0x49, 0x01, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00,
    0xa1, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xb1, 0x00, 0x0a, 0x00, 0x71, 0x00, 0x0e, 0x03,
    0x20, 0x01, 0x24, 0x01, 0x30, 0x07,
];

/// 读标签帧前缀：到路径长度字段为止，路径体由 [`TagPath`] 追加。
const READ_TAG_PREFIX: [u8; 48] = [
    0x70, 0x00, 0x22, 0x00, 0x49, 0x01, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00,
    0xa1, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xb1, 0x00, 0x0e, 0x00, 0x4c, 0x00, 0x4c, 0x04,
];

/// RegisterSession 返回的会话句柄（不透明 4 字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionHandle(pub [u8; 4]);

/// Forward-Open 返回的连接 ID（不透明 4 字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionId(pub [u8; 4]);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", u32::from_le_bytes(self.0))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", u32::from_le_bytes(self.0))
    }
}

/// 16 位请求序列号，0xFFFF 之后回绕到 0。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceCount(u16);

impl SequenceCount {
    pub fn new(start: u16) -> Self {
        Self(start)
    }

    pub fn current(&self) -> u16 {
        self.0
    }

    /// 取出当前值并前进一步。
    pub fn advance(&mut self) -> u16 {
        let value = self.0;
        self.0 = self.0.wrapping_add(1);
        value
    }
}

impl Default for SequenceCount {
    fn default() -> Self {
        Self(INITIAL_SEQUENCE_COUNT)
    }
}

/// 已编码、可直接发送的请求帧
///
/// 线上没有请求关联 ID，响应只能按发送顺序对应。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRequest(Bytes);

impl EncodedRequest {
    fn from_vec(buf: Vec<u8>) -> Self {
        Self(Bytes::from(buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

pub fn encode_register_session() -> EncodedRequest {
    EncodedRequest::from_vec(REGISTER_SESSION_TEMPLATE.to_vec())
}

pub fn encode_connect(session: SessionHandle) -> EncodedRequest {
    let mut buf = CONNECT_TEMPLATE.to_vec();
    put_session(&mut buf, session);
    EncodedRequest::from_vec(buf)
}

/// 编码属性读取请求；会消耗一个序列号。
pub fn encode_read_attribute(
    attribute: AttributeCode,
    session: SessionHandle,
    connection: ConnectionId,
    sequence: &mut SequenceCount,
) -> EncodedRequest {
    let mut buf = READ_ATTRIBUTE_TEMPLATE.to_vec();
    put_session(&mut buf, session);
    put_connection(&mut buf, connection);
    put_u16(&mut buf, SEQUENCE_COUNT_INDEX, sequence.advance());
    buf[ATTRIBUTE_ID_INDEX] = attribute.code();
    EncodedRequest::from_vec(buf)
}

/// 编码读标签请求；路径非法时不消耗序列号。
pub fn encode_read_tag(
    path: &str,
    session: SessionHandle,
    connection: ConnectionId,
    sequence: &mut SequenceCount,
) -> Result<EncodedRequest, EncodeError> {
    let tag: TagPath = path.parse().map_err(|reason| EncodeError::BadPath {
        path: path.to_string(),
        reason,
    })?;

    let mut buf = Vec::with_capacity(READ_TAG_PREFIX.len() + path.len() + 16);
    buf.extend_from_slice(&READ_TAG_PREFIX);
    let words = tag.encode_into(&mut buf);

    let total = buf.len();
    if total > MAX_FRAME_SIZE {
        return Err(EncodeError::FrameTooLarge {
            len: total,
            max: MAX_FRAME_SIZE,
        });
    }
    let path_words = u8::try_from(words).map_err(|_| EncodeError::PathTooLong { words })?;

    put_session(&mut buf, session);
    put_connection(&mut buf, connection);
    put_u16(&mut buf, SEQUENCE_COUNT_INDEX, sequence.advance());
    buf[PATH_LEN_INDEX] = path_words;
    put_u16(
        &mut buf,
        HEADER_LEN_INDEX,
        (total - ENCAPSULATION_HEADER_SIZE) as u16,
    );
    put_u16(&mut buf, DATA_LEN_INDEX, (total - (DATA_LEN_INDEX + 2)) as u16);
    Ok(EncodedRequest::from_vec(buf))
}

/// 从读标签请求帧中取回标签路径（模拟控制器与测试使用）。
pub fn decode_read_tag_path(frame: &[u8]) -> Result<TagPath, DecodeError> {
    let words = *frame.get(PATH_LEN_INDEX).ok_or(DecodeError::Truncated {
        needed: PATH_LEN_INDEX + 1,
        actual: frame.len(),
    })? as usize;
    let start = PATH_LEN_INDEX + 1;
    let end = start + words * 2;
    let path = frame.get(start..end).ok_or(DecodeError::Truncated {
        needed: end,
        actual: frame.len(),
    })?;
    TagPath::decode(path)
}

pub fn read_u16(frame: &[u8], offset: usize) -> Result<u16, DecodeError> {
    frame
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(DecodeError::Truncated {
            needed: offset + 2,
            actual: frame.len(),
        })
}

pub fn read_u32(frame: &[u8], offset: usize) -> Result<u32, DecodeError> {
    frame
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DecodeError::Truncated {
            needed: offset + 4,
            actual: frame.len(),
        })
}

pub fn read_array4(frame: &[u8], offset: usize) -> Result<[u8; 4], DecodeError> {
    frame
        .get(offset..offset + 4)
        .map(|b| [b[0], b[1], b[2], b[3]])
        .ok_or(DecodeError::Truncated {
            needed: offset + 4,
            actual: frame.len(),
        })
}

/// 顶层封装状态码
pub fn response_status(frame: &[u8]) -> Result<u32, DecodeError> {
    read_u32(frame, RESPONSE_STATUS_INDEX)
}

fn put_session(buf: &mut [u8], session: SessionHandle) {
    buf[SESSION_HANDLE_INDEX..SESSION_HANDLE_INDEX + 4].copy_from_slice(&session.0);
}

fn put_connection(buf: &mut [u8], connection: ConnectionId) {
    buf[CONNECTION_ID_CMD_INDEX..CONNECTION_ID_CMD_INDEX + 4].copy_from_slice(&connection.0);
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}
