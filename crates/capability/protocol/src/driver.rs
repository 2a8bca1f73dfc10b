//! EtherNet/IP 驱动运行时
//!
//! 每个驱动一个 tokio 任务，独占套接字与会话；任务内 `select!` 等待停止信号、建连、
//! 套接字帧与三个定时器，把事件交给 [`DriverCore`] 并执行它返回的命令。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let config = DriverConfig::from_json(r#"{"host": "192.168.1.10"}"#)?;
//! let mut driver = EipDriver::new(config, variables, results, alerts, status);
//! driver.start()?;
//! // ...
//! driver.stop().await;
//! ```

use crate::codec::EncapsulationCodec;
use crate::error::{DriverError, ProtocolError};
use crate::machine::{Command, DriverCore, DriverTimings, Input};
use crate::sink::{AlertSink, ConnectivityPublisher, ResultSink, flush_cycle};
use domain::VariableSpec;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep, timeout};
use tokio_util::codec::Framed;
use tracing::{Instrument, debug, info, info_span, warn};

/// 驱动配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// 控制器主机地址
    pub host: String,
    /// 控制器端口（默认 44818）
    #[serde(default = "default_port")]
    pub port: u16,
    /// 轮询间隔（毫秒）
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// TCP 建连超时（毫秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Forward-Open 被拒后的重发间隔（毫秒）
    #[serde(default = "default_connect_retry")]
    pub connect_retry_ms: u64,
    /// Forward-Open 最大重试次数
    #[serde(default = "default_max_connect_retries")]
    pub max_connect_retries: u32,
    /// 重连间隔（毫秒）
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    /// 周期阻塞超过该 tick 数后强制放弃
    #[serde(default = "default_max_blocked_ticks")]
    pub max_blocked_ticks: u32,
}

fn default_port() -> u16 {
    44818
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_connect_retry() -> u64 {
    5000
}

fn default_max_connect_retries() -> u32 {
    25
}

fn default_reconnect_interval() -> u64 {
    5000
}

fn default_max_blocked_ticks() -> u32 {
    3
}

impl DriverConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            poll_interval_ms: default_poll_interval(),
            connect_timeout_ms: default_connect_timeout(),
            connect_retry_ms: default_connect_retry(),
            max_connect_retries: default_max_connect_retries(),
            reconnect_interval_ms: default_reconnect_interval(),
            max_blocked_ticks: default_max_blocked_ticks(),
        }
    }

    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::ConfigParse(e.to_string()))
    }

    pub fn timings(&self) -> DriverTimings {
        DriverTimings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            connect_retry: Duration::from_millis(self.connect_retry_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            max_connect_retries: self.max_connect_retries,
            max_blocked_ticks: self.max_blocked_ticks,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), DriverError> {
        if self.host.trim().is_empty() {
            return Err(DriverError::InvalidConfig("host is empty".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(DriverError::InvalidConfig(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(DriverError::InvalidConfig(
                "connect_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

struct RunningDriver {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// EtherNet/IP 采集驱动
pub struct EipDriver {
    config: DriverConfig,
    variables: Arc<[VariableSpec]>,
    results: Arc<dyn ResultSink>,
    alerts: Arc<dyn AlertSink>,
    status: Arc<dyn ConnectivityPublisher>,
    running: Option<RunningDriver>,
}

impl EipDriver {
    pub fn new(
        config: DriverConfig,
        variables: Vec<VariableSpec>,
        results: Arc<dyn ResultSink>,
        alerts: Arc<dyn AlertSink>,
        status: Arc<dyn ConnectivityPublisher>,
    ) -> Self {
        Self {
            config,
            variables: variables.into(),
            results,
            alerts,
            status,
            running: None,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// 启动驱动任务；只有构造期参数问题会在这里返回错误。
    pub fn start(&mut self) -> Result<(), DriverError> {
        if self.running.is_some() {
            return Err(DriverError::AlreadyRunning);
        }
        if self.variables.is_empty() {
            return Err(DriverError::NoVariables);
        }
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DriverError::NoRuntime)?;

        let run_id = eip_telemetry::new_run_id();
        let span = info_span!(
            "eip_driver",
            run_id = %run_id,
            host = %self.config.host,
            port = self.config.port
        );

        let task = DriverTask {
            core: DriverCore::new(self.variables.clone(), self.config.timings()),
            address: self.config.address(),
            connect_timeout: Duration::from_millis(self.config.connect_timeout_ms),
            results: self.results.clone(),
            alerts: self.alerts.clone(),
            status: self.status.clone(),
            transport: Transport::Idle,
            poll: None,
            connect_retry: None,
            reconnect: None,
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = runtime.spawn(task.run(shutdown_rx).instrument(span));
        self.running = Some(RunningDriver {
            shutdown,
            task: handle,
        });
        info!(
            target: "eip.driver",
            run_id = %run_id,
            variables = self.variables.len(),
            "driver started"
        );
        Ok(())
    }

    /// 停止驱动：立即拆除连接，丢弃在途请求。可重复调用。
    pub async fn stop(&mut self) {
        match self.running.take() {
            Some(running) => {
                let _ = running.shutdown.send(());
                if let Err(e) = running.task.await {
                    warn!(target: "eip.driver", error = %e, "driver task ended abnormally");
                }
            }
            None => {
                self.status.publish_status(false);
                self.alerts.clear_all();
            }
        }
        info!(target: "eip.driver", "driver stopped");
    }

    pub async fn restart(&mut self) -> Result<(), DriverError> {
        debug!(target: "eip.driver", "restarting");
        self.stop().await;
        self.start()
    }
}

enum Transport {
    Idle,
    Connecting(BoxFuture<'static, Result<TcpStream, ProtocolError>>),
    Open(Framed<TcpStream, EncapsulationCodec>),
}

struct DriverTask {
    core: DriverCore,
    address: String,
    connect_timeout: Duration,
    results: Arc<dyn ResultSink>,
    alerts: Arc<dyn AlertSink>,
    status: Arc<dyn ConnectivityPublisher>,
    transport: Transport,
    poll: Option<Interval>,
    connect_retry: Option<Pin<Box<Sleep>>>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

impl DriverTask {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut inputs = VecDeque::from([Input::Start]);

        loop {
            while let Some(input) = inputs.pop_front() {
                let stopping = input == Input::Stop;
                for command in self.core.handle(input) {
                    if let Some(follow_up) = self.execute(command).await {
                        inputs.push_back(follow_up);
                    }
                }
                if stopping {
                    return;
                }
            }

            let input = tokio::select! {
                biased;
                _ = &mut shutdown => Input::Stop,
                input = transport_event(&mut self.transport) => input,
                _ = poll_tick(&mut self.poll) => Input::PollTick,
                _ = sleep_or_pending(&mut self.connect_retry) => Input::ConnectRetryElapsed,
                _ = sleep_or_pending(&mut self.reconnect) => Input::ReconnectElapsed,
            };
            inputs.push_back(input);
        }
    }

    /// 执行一条命令；发送失败时返回需要回灌给状态机的事件。
    async fn execute(&mut self, command: Command) -> Option<Input> {
        match command {
            Command::OpenTransport => {
                info!(target: "eip.driver", address = %self.address, "connecting to controller");
                let address = self.address.clone();
                let limit = self.connect_timeout;
                self.transport = Transport::Connecting(Box::pin(async move {
                    match timeout(limit, TcpStream::connect(&address)).await {
                        Ok(Ok(stream)) => Ok(stream),
                        Ok(Err(e)) => Err(ProtocolError::Io(e)),
                        Err(_) => Err(ProtocolError::Timeout(format!(
                            "connect to {} after {}ms",
                            address,
                            limit.as_millis()
                        ))),
                    }
                }));
            }
            Command::CloseTransport => {
                self.transport = Transport::Idle;
            }
            Command::Send(request) => {
                let Transport::Open(framed) = &mut self.transport else {
                    debug!(target: "eip.driver", "transport not open, request dropped");
                    return None;
                };
                if let Err(e) = framed.send(request).await {
                    return Some(Input::TransportFailed(e.to_string()));
                }
                eip_telemetry::record_frame_sent();
            }
            Command::StartPollTimer(period) => {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.poll = Some(ticker);
            }
            Command::StopPollTimer => self.poll = None,
            Command::ArmConnectRetry(delay) => {
                eip_telemetry::record_connect_retry();
                self.connect_retry = Some(Box::pin(sleep(delay)));
            }
            Command::CancelConnectRetry => self.connect_retry = None,
            Command::ArmReconnect(delay) => {
                eip_telemetry::record_reconnect_scheduled();
                info!(
                    target: "eip.driver",
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.reconnect = Some(Box::pin(sleep(delay)));
            }
            Command::CancelReconnect => self.reconnect = None,
            Command::RaiseAlert(alert) => self.alerts.raise(alert),
            Command::ClearAlert(key) => self.alerts.clear(&key),
            Command::ClearAllAlerts => self.alerts.clear_all(),
            Command::PublishStatus(connected) => self.status.publish_status(connected),
            Command::Flush(cycle) => {
                eip_telemetry::record_cycle_completed();
                debug!(
                    target: "eip.driver",
                    generation = cycle.generation(),
                    "poll cycle complete"
                );
                flush_cycle(
                    self.core.variables(),
                    &cycle,
                    self.results.as_ref(),
                    self.alerts.as_ref(),
                )
                .await;
            }
        }
        None
    }
}

async fn transport_event(transport: &mut Transport) -> Input {
    match transport {
        Transport::Idle => pending().await,
        Transport::Connecting(connect) => {
            let connected = connect.await;
            match connected {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(target: "eip.driver", error = %e, "set_nodelay failed");
                    }
                    *transport = Transport::Open(Framed::new(stream, EncapsulationCodec));
                    Input::TransportConnected
                }
                Err(e) => {
                    *transport = Transport::Idle;
                    Input::TransportFailed(e.to_string())
                }
            }
        }
        Transport::Open(framed) => match framed.next().await {
            Some(Ok(frame)) => {
                eip_telemetry::record_frame_received();
                Input::Frame(frame)
            }
            Some(Err(e)) => Input::TransportFailed(e.to_string()),
            None => Input::TransportFailed("connection closed by peer".to_string()),
        },
    }
}

async fn poll_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn sleep_or_pending(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(timer) => {
            timer.as_mut().await;
            *slot = None;
        }
        None => pending().await,
    }
}
