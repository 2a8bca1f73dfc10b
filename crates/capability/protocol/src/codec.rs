//! 封装帧重组
//!
//! TCP 是字节流，控制器的一次响应可能被拆成多段，也可能与下一帧粘连。
//! 解码器按 24 字节封装头中偏移 2 处的长度字段切出完整帧。

use crate::error::ProtocolError;
use crate::frame::{EncodedRequest, ENCAPSULATION_HEADER_SIZE, HEADER_LEN_INDEX, MAX_FRAME_SIZE};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// 封装帧编解码器
#[derive(Debug, Default, Clone, Copy)]
pub struct EncapsulationCodec;

impl Decoder for EncapsulationCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < ENCAPSULATION_HEADER_SIZE {
            return Ok(None);
        }

        let body_len =
            u16::from_le_bytes([src[HEADER_LEN_INDEX], src[HEADER_LEN_INDEX + 1]]) as usize;
        let frame_len = ENCAPSULATION_HEADER_SIZE + body_len;
        if frame_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(frame_len));
        }

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(frame_len).freeze()))
    }
}

impl Encoder<EncodedRequest> for EncapsulationCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: EncodedRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(item.len()));
        }
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}
