//! 连接会话
//!
//! 会话句柄、连接 ID 与序列号只属于一个 [`ConnectionSession`]，握手阶段用单一枚举表达，
//! "注册中且已连接"这类组合无法构造。

use crate::error::EncodeError;
use crate::frame::{
    CONNECTION_ERROR_INDEX, CONNECTION_ID_RESP_INDEX, ConnectionId, EncodedRequest,
    SESSION_HANDLE_INDEX, SequenceCount, SessionHandle, encode_connect, encode_read_attribute,
    encode_read_tag, read_array4, read_u16, response_status,
};
use domain::VariableRequest;

/// 握手与连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Registering,
    Connecting {
        session: SessionHandle,
        retries: u32,
    },
    Connected {
        session: SessionHandle,
        connection: ConnectionId,
    },
}

/// 握手失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// 顶层封装状态非零
    Status(u32),
    /// Forward-Open 响应中的连接错误子字段非零
    ConnectionError(u16),
    /// 响应长度不足
    Malformed,
}

impl std::fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeFailure::Status(status) => write!(f, "status 0x{:08X}", status),
            HandshakeFailure::ConnectionError(code) => write!(f, "connection error 0x{:04X}", code),
            HandshakeFailure::Malformed => f.write_str("malformed response"),
        }
    }
}

/// 处理一帧握手响应后的下一步
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// 注册成功，发送 Forward-Open
    SendConnect(EncodedRequest),
    /// 连接建立
    Established(ConnectionId),
    /// Forward-Open 被拒绝，稍后用同一会话句柄重发
    RetryConnect { attempt: u32, failure: HandshakeFailure },
    /// 注册被拒绝，需要完整重连
    RegisterRejected(HandshakeFailure),
    /// 重试次数用尽，需要完整重连
    ConnectRejected(HandshakeFailure),
    /// 当前状态不处理握手帧
    Ignored,
}

/// 单连接会话
#[derive(Debug)]
pub struct ConnectionSession {
    state: SessionState,
    sequence: SequenceCount,
    max_connect_retries: u32,
}

impl ConnectionSession {
    pub fn new(max_connect_retries: u32) -> Self {
        Self {
            state: SessionState::Disconnected,
            sequence: SequenceCount::default(),
            max_connect_retries,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sequence(&self) -> SequenceCount {
        self.sequence
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected { .. })
    }

    /// 是否处于等待握手响应的阶段
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self.state,
            SessionState::Registering | SessionState::Connecting { .. }
        )
    }

    /// TCP 建连后进入注册阶段，返回 RegisterSession 帧。
    pub fn begin_registration(&mut self) -> EncodedRequest {
        self.state = SessionState::Registering;
        crate::frame::encode_register_session()
    }

    /// 处理注册或 Forward-Open 的响应帧。
    pub fn on_handshake_frame(&mut self, frame: &[u8]) -> HandshakeStep {
        match self.state {
            SessionState::Registering => match register_outcome(frame) {
                Ok(session) => {
                    self.state = SessionState::Connecting {
                        session,
                        retries: 0,
                    };
                    HandshakeStep::SendConnect(encode_connect(session))
                }
                Err(failure) => HandshakeStep::RegisterRejected(failure),
            },
            SessionState::Connecting { session, retries } => match connect_outcome(frame) {
                Ok(connection) => {
                    self.state = SessionState::Connected {
                        session,
                        connection,
                    };
                    HandshakeStep::Established(connection)
                }
                Err(failure) if retries < self.max_connect_retries => {
                    let attempt = retries + 1;
                    self.state = SessionState::Connecting {
                        session,
                        retries: attempt,
                    };
                    HandshakeStep::RetryConnect { attempt, failure }
                }
                Err(failure) => HandshakeStep::ConnectRejected(failure),
            },
            SessionState::Disconnected | SessionState::Connected { .. } => HandshakeStep::Ignored,
        }
    }

    /// 重发的 Forward-Open 帧（沿用同一会话句柄）。
    pub fn connect_request(&self) -> Option<EncodedRequest> {
        match self.state {
            SessionState::Connecting { session, .. } => Some(encode_connect(session)),
            _ => None,
        }
    }

    /// 为一个变量编码读请求；成功时消耗一个序列号。
    pub fn encode_read(&mut self, request: &VariableRequest) -> Result<EncodedRequest, EncodeError> {
        let SessionState::Connected {
            session,
            connection,
        } = self.state
        else {
            return Err(EncodeError::NotConnected);
        };

        match request {
            VariableRequest::Attribute(code) => Ok(encode_read_attribute(
                *code,
                session,
                connection,
                &mut self.sequence,
            )),
            VariableRequest::Tag(tag) => encode_read_tag(
                &tag.effective_path(),
                session,
                connection,
                &mut self.sequence,
            ),
        }
    }

    /// 无条件拆除：回到 Disconnected 并复位序列号。
    pub fn teardown(&mut self) {
        self.state = SessionState::Disconnected;
        self.sequence = SequenceCount::default();
    }
}

fn register_outcome(frame: &[u8]) -> Result<SessionHandle, HandshakeFailure> {
    let status = response_status(frame).map_err(|_| HandshakeFailure::Malformed)?;
    if status != 0 {
        return Err(HandshakeFailure::Status(status));
    }
    read_array4(frame, SESSION_HANDLE_INDEX)
        .map(SessionHandle)
        .map_err(|_| HandshakeFailure::Malformed)
}

fn connect_outcome(frame: &[u8]) -> Result<ConnectionId, HandshakeFailure> {
    let status = response_status(frame).map_err(|_| HandshakeFailure::Malformed)?;
    if status != 0 {
        return Err(HandshakeFailure::Status(status));
    }
    let connection_error =
        read_u16(frame, CONNECTION_ERROR_INDEX).map_err(|_| HandshakeFailure::Malformed)?;
    if connection_error != 0 {
        return Err(HandshakeFailure::ConnectionError(connection_error));
    }
    read_array4(frame, CONNECTION_ID_RESP_INDEX)
        .map(ConnectionId)
        .map_err(|_| HandshakeFailure::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{INITIAL_SEQUENCE_COUNT, RESPONSE_STATUS_INDEX, SEQUENCE_COUNT_INDEX};
    use domain::{AttributeCode, TagRef};

    fn register_reply(handle: [u8; 4], status: u32) -> Vec<u8> {
        let mut frame = vec![0u8; 28];
        frame[4..8].copy_from_slice(&handle);
        frame[RESPONSE_STATUS_INDEX..RESPONSE_STATUS_INDEX + 4].copy_from_slice(&status.to_le_bytes());
        frame
    }

    fn connect_reply(connection: [u8; 4], status: u32, conn_error: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 60];
        frame[RESPONSE_STATUS_INDEX..RESPONSE_STATUS_INDEX + 4].copy_from_slice(&status.to_le_bytes());
        frame[42..44].copy_from_slice(&conn_error.to_le_bytes());
        frame[44..48].copy_from_slice(&connection);
        frame
    }

    fn connected(max_retries: u32) -> ConnectionSession {
        let mut session = ConnectionSession::new(max_retries);
        session.begin_registration();
        session.on_handshake_frame(&register_reply([1, 2, 3, 4], 0));
        session.on_handshake_frame(&connect_reply([5, 6, 7, 8], 0, 0));
        session
    }

    #[test]
    fn test_full_handshake() {
        let mut session = ConnectionSession::new(25);
        assert_eq!(session.state(), SessionState::Disconnected);

        session.begin_registration();
        assert_eq!(session.state(), SessionState::Registering);

        let step = session.on_handshake_frame(&register_reply([1, 2, 3, 4], 0));
        let HandshakeStep::SendConnect(connect) = step else {
            panic!("expected SendConnect, got {:?}", step);
        };
        assert_eq!(&connect.as_bytes()[4..8], &[1, 2, 3, 4]);

        let step = session.on_handshake_frame(&connect_reply([5, 6, 7, 8], 0, 0));
        assert_eq!(step, HandshakeStep::Established(ConnectionId([5, 6, 7, 8])));
        assert!(session.is_connected());
    }

    #[test]
    fn test_register_rejected() {
        let mut session = ConnectionSession::new(25);
        session.begin_registration();
        assert_eq!(
            session.on_handshake_frame(&register_reply([0; 4], 0x64)),
            HandshakeStep::RegisterRejected(HandshakeFailure::Status(0x64))
        );
        assert_eq!(
            session.on_handshake_frame(&[0u8; 4]),
            HandshakeStep::RegisterRejected(HandshakeFailure::Malformed)
        );
    }

    #[test]
    fn test_connect_retry_is_bounded() {
        let mut session = ConnectionSession::new(25);
        session.begin_registration();
        session.on_handshake_frame(&register_reply([9, 9, 9, 9], 0));

        for attempt in 1..=25 {
            let step = session.on_handshake_frame(&connect_reply([0; 4], 0, 0x0100));
            assert_eq!(
                step,
                HandshakeStep::RetryConnect {
                    attempt,
                    failure: HandshakeFailure::ConnectionError(0x0100)
                }
            );
            let resend = session.connect_request().unwrap();
            assert_eq!(&resend.as_bytes()[4..8], &[9, 9, 9, 9]);
        }
        assert_eq!(
            session.on_handshake_frame(&connect_reply([0; 4], 1, 0)),
            HandshakeStep::ConnectRejected(HandshakeFailure::Status(1))
        );
    }

    #[test]
    fn test_frames_ignored_outside_handshake() {
        let mut session = ConnectionSession::new(25);
        assert_eq!(
            session.on_handshake_frame(&register_reply([1; 4], 0)),
            HandshakeStep::Ignored
        );
        let mut session = connected(25);
        assert_eq!(
            session.on_handshake_frame(&connect_reply([1; 4], 0, 0)),
            HandshakeStep::Ignored
        );
    }

    #[test]
    fn test_encode_read_requires_connection() {
        let mut session = ConnectionSession::new(25);
        assert_eq!(
            session.encode_read(&VariableRequest::Attribute(AttributeCode::Status)),
            Err(EncodeError::NotConnected)
        );
    }

    #[test]
    fn test_encode_read_uses_program_scope_and_sequence() {
        let mut session = connected(25);
        let tag = VariableRequest::Tag(TagRef::in_program("count", "Main"));
        let frame = session.encode_read(&tag).unwrap();
        assert_eq!(
            crate::frame::decode_read_tag_path(frame.as_bytes())
                .unwrap()
                .to_string(),
            "Program:Main.count"
        );
        assert_eq!(
            read_u16(frame.as_bytes(), SEQUENCE_COUNT_INDEX).unwrap(),
            INITIAL_SEQUENCE_COUNT
        );
        assert_eq!(session.sequence().current(), INITIAL_SEQUENCE_COUNT + 1);
    }

    #[test]
    fn test_teardown_resets_sequence() {
        let mut session = connected(25);
        session
            .encode_read(&VariableRequest::Attribute(AttributeCode::VendorId))
            .unwrap();
        session.teardown();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.sequence().current(), INITIAL_SEQUENCE_COUNT);
        assert!(session.connect_request().is_none());
    }
}
