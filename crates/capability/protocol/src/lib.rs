//! # EtherNet/IP 原始套接字采集驱动
//!
//! 直接对封装协议收发字节，按固定周期读取控制器的标签与设备身份属性：
//! - **帧编码**：四种请求帧由静态模板加固定偏移处的动态字段组成
//! - **标签路径**：`seg[.seg]*` 文本与二进制符号段互转
//! - **响应解码**：按一字节类型码查表得到标量或数组
//! - **连接状态机**：注册会话 → Forward-Open → 轮询，带有界重试与重连
//! - **轮询调度**：同一时刻最多一个在途请求，周期结束后交给结果下游
//!
//! ## 架构设计
//!
//! ```text
//! EipDriver (tokio 任务，独占套接字)
//!       │  Input（建连 / 帧 / 定时器 / 停止）
//!       ▼
//! DriverCore（无 IO）
//!       ├── ConnectionSession  ── frame / tag_path
//!       └── PollScheduler      ── decode
//!       │  Command（发送 / 定时器 / 告警 / 状态 / 刷新）
//!       ▼
//! ResultSink / AlertSink / ConnectivityPublisher
//! ```
//!
//! ## 配置格式
//!
//! ```json
//! { "host": "192.168.1.10", "port": 44818, "poll_interval_ms": 1000 }
//! ```

mod codec;
mod decode;
mod driver;
mod error;
mod frame;
mod machine;
mod scheduler;
mod session;
mod sink;
mod tag_path;

pub use codec::EncapsulationCodec;
pub use decode::{WireType, decode_attribute, decode_tag_value, join_i64};
pub use driver::{DriverConfig, EipDriver};
pub use error::{DecodeError, DriverError, EncodeError, PathError, ProtocolError, SinkError};
pub use frame::{
    ATTRIBUTE_DATA_INDEX, ATTRIBUTE_ID_INDEX, CONNECTION_ERROR_INDEX, CONNECTION_ID_CMD_INDEX,
    CONNECTION_ID_RESP_INDEX, ConnectionId, DATA_INDEX, DATA_LEN_INDEX, DATA_TYPE_INDEX,
    ENCAPSULATION_HEADER_SIZE, EncodedRequest, HEADER_LEN_INDEX, INITIAL_SEQUENCE_COUNT,
    MAX_FRAME_SIZE, PATH_LEN_INDEX, REGISTER_SESSION_CMD, RESPONSE_STATUS_INDEX,
    SEND_RR_DATA_CMD, SEND_UNIT_DATA_CMD, SEQUENCE_COUNT_INDEX, SERVICE_CODE_INDEX,
    SERVICE_GET_ATTRIBUTE_SINGLE, SERVICE_READ_TAG, SESSION_HANDLE_INDEX, SequenceCount,
    SessionHandle, decode_read_tag_path, encode_connect, encode_read_attribute, encode_read_tag,
    encode_register_session, read_u16, read_u32, response_status,
};
pub use machine::{Command, DriverCore, DriverTimings, Input};
pub use scheduler::{
    CompletedCycle, Dispatch, PollScheduler, ReadFailure, ReadResult, ResponseOutcome, TickOutcome,
};
pub use session::{ConnectionSession, HandshakeFailure, HandshakeStep, SessionState};
pub use sink::{
    Alert, AlertSink, ConnectivityPublisher, DATABASE_ERROR, HOST_CONNECT_ERROR,
    InMemoryResultSink, PLC_CONNECT_ERROR, PLC_REGISTER_ERROR, ResultSink, TracingAlertSink,
    WatchConnectivity, flush_cycle,
};
pub use tag_path::TagPath;
