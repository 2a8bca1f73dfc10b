//! 追踪初始化、驱动运行 ID 与驱动指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 驱动指标快照（MVP）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub cycles_completed: u64,
    pub cycles_abandoned: u64,
    pub stale_responses_dropped: u64,
    pub path_encode_failures: u64,
    pub decode_failures: u64,
    pub read_failures: u64,
    pub connect_retries: u64,
    pub reconnects_scheduled: u64,
    pub sink_write_failures: u64,
}

/// 驱动指标（MVP）。
pub struct DriverMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    cycles_completed: AtomicU64,
    cycles_abandoned: AtomicU64,
    stale_responses_dropped: AtomicU64,
    path_encode_failures: AtomicU64,
    decode_failures: AtomicU64,
    read_failures: AtomicU64,
    connect_retries: AtomicU64,
    reconnects_scheduled: AtomicU64,
    sink_write_failures: AtomicU64,
}

impl DriverMetrics {
    pub fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            cycles_completed: AtomicU64::new(0),
            cycles_abandoned: AtomicU64::new(0),
            stale_responses_dropped: AtomicU64::new(0),
            path_encode_failures: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            connect_retries: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            sink_write_failures: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_abandoned: self.cycles_abandoned.load(Ordering::Relaxed),
            stale_responses_dropped: self.stale_responses_dropped.load(Ordering::Relaxed),
            path_encode_failures: self.path_encode_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            connect_retries: self.connect_retries.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            sink_write_failures: self.sink_write_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for DriverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<DriverMetrics> = OnceLock::new();

/// 获取全局指标实例（MVP）。
pub fn metrics() -> &'static DriverMetrics {
    METRICS.get_or_init(DriverMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成驱动运行 ID（每次 start 一个）。
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 记录发送帧数。
pub fn record_frame_sent() {
    metrics().frames_sent.fetch_add(1, Ordering::Relaxed);
}

/// 记录接收帧数。
pub fn record_frame_received() {
    metrics().frames_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录完成的轮询周期。
pub fn record_cycle_completed() {
    metrics().cycles_completed.fetch_add(1, Ordering::Relaxed);
}

/// 记录被强制放弃的轮询周期。
pub fn record_cycle_abandoned() {
    metrics().cycles_abandoned.fetch_add(1, Ordering::Relaxed);
}

/// 记录丢弃的过期响应。
pub fn record_stale_response() {
    metrics()
        .stale_responses_dropped
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录标签路径编码失败。
pub fn record_path_encode_failure() {
    metrics().path_encode_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录响应解码失败。
pub fn record_decode_failure() {
    metrics().decode_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录单变量读取失败（状态码非零）。
pub fn record_read_failure() {
    metrics().read_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录 Forward-Open 重试。
pub fn record_connect_retry() {
    metrics().connect_retries.fetch_add(1, Ordering::Relaxed);
}

/// 记录已安排的重连。
pub fn record_reconnect_scheduled() {
    metrics()
        .reconnects_scheduled
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录结果下游写入失败。
pub fn record_sink_write_failure() {
    metrics()
        .sink_write_failures
        .fetch_add(1, Ordering::Relaxed);
}
