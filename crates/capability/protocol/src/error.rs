//! 协议错误类型定义

/// 协议通信错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 帧长度超出上限
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// 配置解析错误
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),
}

/// 标签路径语法错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty segment")]
    EmptySegment,
    #[error("unbalanced brackets in `{0}`")]
    UnbalancedBrackets(String),
    #[error("more than two indices in `{0}`")]
    TooManyIndices(String),
    #[error("non-numeric index `{0}`")]
    BadIndex(String),
    #[error("index {0} out of range")]
    IndexOutOfRange(u64),
    #[error("non-ascii identifier `{0}`")]
    NonAscii(String),
    #[error("identifier too long ({0} chars)")]
    NameTooLong(usize),
}

/// 请求编码错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("bad tag path `{path}`: {reason}")]
    BadPath { path: String, reason: PathError },
    #[error("encoded request exceeds {max} bytes ({len})")]
    FrameTooLarge { len: usize, max: usize },
    #[error("tag path is {words} words, the path length byte holds at most 255")]
    PathTooLong { words: usize },
    #[error("session not connected")]
    NotConnected,
}

/// 响应解码错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated frame: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("unknown data type code 0x{0:02X}")]
    UnknownType(u8),
    #[error("malformed symbolic path at byte {0}")]
    MalformedPath(usize),
}

/// 结果下游写入错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("write failed: {0}")]
    Write(String),
}

/// 驱动启动错误（仅在 start 时同步返回）
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("no variables configured")]
    NoVariables,
    #[error("driver already running")]
    AlreadyRunning,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("no tokio runtime available")]
    NoRuntime,
}
