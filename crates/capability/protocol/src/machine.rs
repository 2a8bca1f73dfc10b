//! 驱动状态机
//!
//! [`DriverCore`] 不做任何 IO：输入一个事件（套接字、定时器、停止），输出一组命令交给运行时执行。
//! 握手、重试、重连与轮询周期的全部决策都在这里，便于不借助网络做确定性测试。

use crate::frame::EncodedRequest;
use crate::scheduler::{CompletedCycle, Dispatch, PollScheduler, ResponseOutcome, TickOutcome};
use crate::session::{ConnectionSession, HandshakeStep};
use crate::sink::{Alert, HOST_CONNECT_ERROR, PLC_CONNECT_ERROR, PLC_REGISTER_ERROR};
use bytes::Bytes;
use domain::VariableSpec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 状态机使用的时间参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverTimings {
    pub poll_interval: Duration,
    pub connect_retry: Duration,
    pub reconnect_interval: Duration,
    pub max_connect_retries: u32,
    pub max_blocked_ticks: u32,
}

impl Default for DriverTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            connect_retry: Duration::from_millis(5000),
            reconnect_interval: Duration::from_millis(5000),
            max_connect_retries: 25,
            max_blocked_ticks: 3,
        }
    }
}

/// 输入事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Start,
    TransportConnected,
    TransportFailed(String),
    Frame(Bytes),
    PollTick,
    ConnectRetryElapsed,
    ReconnectElapsed,
    Stop,
}

/// 交给运行时执行的命令
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenTransport,
    CloseTransport,
    Send(EncodedRequest),
    StartPollTimer(Duration),
    StopPollTimer,
    ArmConnectRetry(Duration),
    CancelConnectRetry,
    ArmReconnect(Duration),
    CancelReconnect,
    RaiseAlert(Alert),
    ClearAlert(String),
    ClearAllAlerts,
    PublishStatus(bool),
    Flush(CompletedCycle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportPhase {
    Closed,
    Opening,
    Open,
}

#[derive(Debug, Default, Clone, Copy)]
struct PendingTimers {
    poll: bool,
    connect_retry: bool,
    reconnect: bool,
}

/// 驱动核心
#[derive(Debug)]
pub struct DriverCore {
    timings: DriverTimings,
    session: ConnectionSession,
    scheduler: PollScheduler,
    transport: TransportPhase,
    timers: PendingTimers,
    running: bool,
}

impl DriverCore {
    pub fn new(variables: Arc<[VariableSpec]>, timings: DriverTimings) -> Self {
        Self {
            session: ConnectionSession::new(timings.max_connect_retries),
            scheduler: PollScheduler::new(variables, timings.max_blocked_ticks),
            timings,
            transport: TransportPhase::Closed,
            timers: PendingTimers::default(),
            running: false,
        }
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn variables(&self) -> &Arc<[VariableSpec]> {
        self.scheduler.variables()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// 当前挂起的定时器数量（轮询、Forward-Open 重试、重连）
    pub fn pending_timers(&self) -> usize {
        [
            self.timers.poll,
            self.timers.connect_retry,
            self.timers.reconnect,
        ]
        .into_iter()
        .filter(|armed| *armed)
        .count()
    }

    pub fn handle(&mut self, input: Input) -> Vec<Command> {
        match input {
            Input::Start => self.on_start(),
            Input::Stop => self.on_stop(),
            _ if !self.running => {
                debug!(target: "eip.driver", ?input, "driver stopped, ignoring input");
                Vec::new()
            }
            Input::TransportConnected => self.on_transport_connected(),
            Input::TransportFailed(reason) => self.on_transport_failed(reason),
            Input::Frame(frame) => self.on_frame(&frame),
            Input::PollTick => self.on_poll_tick(),
            Input::ConnectRetryElapsed => self.on_connect_retry(),
            Input::ReconnectElapsed => self.on_reconnect(),
        }
    }

    fn on_start(&mut self) -> Vec<Command> {
        if self.running {
            return Vec::new();
        }
        self.running = true;
        self.transport = TransportPhase::Opening;
        vec![Command::PublishStatus(false), Command::OpenTransport]
    }

    fn on_stop(&mut self) -> Vec<Command> {
        self.running = false;
        let mut commands = self.teardown();
        commands.push(Command::PublishStatus(false));
        commands.push(Command::ClearAllAlerts);
        commands
    }

    fn on_transport_connected(&mut self) -> Vec<Command> {
        if self.transport != TransportPhase::Opening {
            return Vec::new();
        }
        self.transport = TransportPhase::Open;
        info!(target: "eip.driver", "tcp connected, registering session");
        vec![
            Command::ClearAlert(HOST_CONNECT_ERROR.to_string()),
            Command::Send(self.session.begin_registration()),
        ]
    }

    fn on_transport_failed(&mut self, reason: String) -> Vec<Command> {
        warn!(target: "eip.driver", error = %reason, "transport error");
        let mut commands = vec![
            Command::RaiseAlert(Alert::host_connect_error(&reason)),
            Command::PublishStatus(false),
        ];
        commands.extend(self.schedule_reconnect());
        commands
    }

    fn on_frame(&mut self, frame: &[u8]) -> Vec<Command> {
        if self.session.is_handshaking() {
            return self.on_handshake(frame);
        }
        if !self.session.is_connected() {
            return Vec::new();
        }

        match self.scheduler.on_response(frame, &mut self.session) {
            ResponseOutcome::Dispatch(dispatch) => self.dispatch(dispatch),
            ResponseOutcome::Stale { generation, then } => {
                eip_telemetry::record_stale_response();
                debug!(target: "eip.driver", generation, "stale response dropped");
                self.dispatch(then)
            }
            ResponseOutcome::Unexpected => {
                debug!(target: "eip.driver", len = frame.len(), "unexpected frame ignored");
                Vec::new()
            }
        }
    }

    fn on_handshake(&mut self, frame: &[u8]) -> Vec<Command> {
        match self.session.on_handshake_frame(frame) {
            HandshakeStep::SendConnect(request) => {
                info!(target: "eip.driver", "session registered, opening connection");
                vec![
                    Command::ClearAlert(PLC_REGISTER_ERROR.to_string()),
                    Command::Send(request),
                ]
            }
            HandshakeStep::Established(connection) => {
                info!(target: "eip.driver", %connection, "connection established, polling");
                self.timers.poll = true;
                vec![
                    Command::ClearAlert(PLC_CONNECT_ERROR.to_string()),
                    Command::PublishStatus(true),
                    Command::StartPollTimer(self.timings.poll_interval),
                ]
            }
            HandshakeStep::RetryConnect { attempt, failure } => {
                warn!(
                    target: "eip.driver",
                    attempt,
                    max = self.timings.max_connect_retries,
                    %failure,
                    "forward open rejected, retrying"
                );
                self.timers.connect_retry = true;
                vec![Command::ArmConnectRetry(self.timings.connect_retry)]
            }
            HandshakeStep::RegisterRejected(failure) => {
                warn!(target: "eip.driver", %failure, "register session rejected");
                let mut commands = vec![Command::RaiseAlert(Alert::plc_register_error())];
                commands.extend(self.schedule_reconnect());
                commands
            }
            HandshakeStep::ConnectRejected(failure) => {
                warn!(target: "eip.driver", %failure, "forward open retries exhausted");
                let mut commands = vec![Command::RaiseAlert(Alert::plc_connect_error())];
                commands.extend(self.schedule_reconnect());
                commands
            }
            HandshakeStep::Ignored => Vec::new(),
        }
    }

    fn on_poll_tick(&mut self) -> Vec<Command> {
        if !self.session.is_connected() {
            return Vec::new();
        }
        match self.scheduler.on_tick(&mut self.session) {
            TickOutcome::Blocked { blocked } => {
                debug!(target: "eip.driver", blocked, "previous cycle still active, skipping tick");
                vec![Command::PublishStatus(false)]
            }
            TickOutcome::Abandoned { generation } => {
                eip_telemetry::record_cycle_abandoned();
                warn!(target: "eip.driver", generation, "poll cycle abandoned");
                vec![Command::PublishStatus(false)]
            }
            TickOutcome::OrphanExpired { generation } => {
                warn!(
                    target: "eip.driver",
                    generation,
                    "abandoned request unanswered, reconnecting"
                );
                let mut commands = vec![Command::PublishStatus(false)];
                commands.extend(self.schedule_reconnect());
                commands
            }
            TickOutcome::Dispatched(dispatch) => self.dispatch(dispatch),
        }
    }

    fn on_connect_retry(&mut self) -> Vec<Command> {
        self.timers.connect_retry = false;
        match self.session.connect_request() {
            Some(request) => vec![Command::Send(request)],
            None => Vec::new(),
        }
    }

    fn on_reconnect(&mut self) -> Vec<Command> {
        self.timers.reconnect = false;
        if self.transport != TransportPhase::Closed {
            return Vec::new();
        }
        info!(target: "eip.driver", "reconnecting");
        self.transport = TransportPhase::Opening;
        vec![Command::OpenTransport]
    }

    fn dispatch(&mut self, dispatch: Dispatch) -> Vec<Command> {
        match dispatch {
            Dispatch::Send(request) => vec![Command::Send(request)],
            Dispatch::Complete(cycle) => vec![Command::PublishStatus(true), Command::Flush(cycle)],
        }
    }

    /// 拆除连接并在重连间隔后重新打开。
    fn schedule_reconnect(&mut self) -> Vec<Command> {
        let mut commands = self.teardown();
        self.timers.reconnect = true;
        commands.push(Command::ArmReconnect(self.timings.reconnect_interval));
        commands
    }

    /// 无条件拆除：停止定时器、关闭套接字、复位会话与周期。
    fn teardown(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        if std::mem::take(&mut self.timers.poll) {
            commands.push(Command::StopPollTimer);
        }
        if std::mem::take(&mut self.timers.connect_retry) {
            commands.push(Command::CancelConnectRetry);
        }
        if std::mem::take(&mut self.timers.reconnect) {
            commands.push(Command::CancelReconnect);
        }
        if self.transport != TransportPhase::Closed {
            commands.push(Command::CloseTransport);
            self.transport = TransportPhase::Closed;
        }
        self.session.teardown();
        self.scheduler.reset();
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{
        DATA_INDEX, DATA_TYPE_INDEX, INITIAL_SEQUENCE_COUNT, RESPONSE_STATUS_INDEX,
        SEQUENCE_COUNT_INDEX, read_u16,
    };
    use crate::session::SessionState;
    use domain::{AttributeCode, Value};

    fn register_ok() -> Bytes {
        let mut frame = vec![0u8; 28];
        frame[4..8].copy_from_slice(&[0x10, 0x20, 0x30, 0x40]);
        Bytes::from(frame)
    }

    fn connect_reply(status: u32) -> Bytes {
        let mut frame = vec![0u8; 48];
        frame[RESPONSE_STATUS_INDEX..RESPONSE_STATUS_INDEX + 4].copy_from_slice(&status.to_le_bytes());
        frame[44..48].copy_from_slice(&[1, 2, 3, 4]);
        Bytes::from(frame)
    }

    fn attribute_reply(value: u16) -> Bytes {
        let mut frame = vec![0u8; 50];
        frame.extend_from_slice(&value.to_le_bytes());
        Bytes::from(frame)
    }

    fn int16_reply(value: i16) -> Bytes {
        let mut frame = vec![0u8; DATA_INDEX];
        frame[DATA_TYPE_INDEX] = 0xC3;
        frame.extend_from_slice(&value.to_le_bytes());
        Bytes::from(frame)
    }

    fn error_reply(status: u32) -> Bytes {
        let mut frame = vec![0u8; DATA_INDEX];
        frame[RESPONSE_STATUS_INDEX..RESPONSE_STATUS_INDEX + 4].copy_from_slice(&status.to_le_bytes());
        Bytes::from(frame)
    }

    fn driver_core(variables: Vec<VariableSpec>) -> DriverCore {
        DriverCore::new(variables.into(), DriverTimings::default())
    }

    fn connected(variables: Vec<VariableSpec>) -> DriverCore {
        let mut core = driver_core(variables);
        core.handle(Input::Start);
        core.handle(Input::TransportConnected);
        core.handle(Input::Frame(register_ok()));
        let commands = core.handle(Input::Frame(connect_reply(0)));
        assert!(commands.contains(&Command::StartPollTimer(Duration::from_millis(1000))));
        core
    }

    fn sent(commands: &[Command]) -> Vec<&EncodedRequest> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Send(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    fn flushed(commands: Vec<Command>) -> CompletedCycle {
        commands
            .into_iter()
            .find_map(|c| match c {
                Command::Flush(cycle) => Some(cycle),
                _ => None,
            })
            .expect("cycle flushed")
    }

    #[test]
    fn test_start_opens_transport_and_registers() {
        let mut core = driver_core(vec![VariableSpec::tag("a", "a")]);
        assert_eq!(
            core.handle(Input::Start),
            vec![Command::PublishStatus(false), Command::OpenTransport]
        );
        assert!(core.handle(Input::Start).is_empty());

        let commands = core.handle(Input::TransportConnected);
        assert_eq!(commands[0], Command::ClearAlert(HOST_CONNECT_ERROR.to_string()));
        assert_eq!(sent(&commands)[0].as_bytes()[0], 0x65);
        assert_eq!(core.session().state(), SessionState::Registering);

        let commands = core.handle(Input::Frame(register_ok()));
        assert_eq!(commands[0], Command::ClearAlert(PLC_REGISTER_ERROR.to_string()));
        assert_eq!(&sent(&commands)[0].as_bytes()[4..8], &[0x10, 0x20, 0x30, 0x40]);
    }

    #[test]
    fn test_bounded_connect_retry() {
        let mut core = driver_core(vec![VariableSpec::tag("a", "a")]);
        core.handle(Input::Start);
        core.handle(Input::TransportConnected);
        core.handle(Input::Frame(register_ok()));

        let mut retries = 0;
        loop {
            let commands = core.handle(Input::Frame(connect_reply(1)));
            if commands == vec![Command::ArmConnectRetry(Duration::from_millis(5000))] {
                retries += 1;
                let resend = core.handle(Input::ConnectRetryElapsed);
                assert_eq!(sent(&resend)[0].as_bytes()[0], 0x6F);
                continue;
            }
            assert!(commands.contains(&Command::RaiseAlert(Alert::plc_connect_error())));
            assert!(commands.contains(&Command::CloseTransport));
            assert!(commands.contains(&Command::ArmReconnect(Duration::from_millis(5000))));
            break;
        }
        assert_eq!(retries, 25);
        assert_eq!(core.session().state(), SessionState::Disconnected);

        assert_eq!(core.handle(Input::ReconnectElapsed), vec![Command::OpenTransport]);
    }

    #[test]
    fn test_register_rejected_schedules_reconnect() {
        let mut core = driver_core(vec![VariableSpec::tag("a", "a")]);
        core.handle(Input::Start);
        core.handle(Input::TransportConnected);
        let mut frame = vec![0u8; 28];
        frame[8] = 0x01;
        let commands = core.handle(Input::Frame(Bytes::from(frame)));
        assert_eq!(
            commands,
            vec![
                Command::RaiseAlert(Alert::plc_register_error()),
                Command::CloseTransport,
                Command::ArmReconnect(Duration::from_millis(5000)),
            ]
        );
    }

    #[test]
    fn test_scenario_attribute_then_tag() {
        let mut core = connected(vec![
            VariableSpec::attribute("vendor", AttributeCode::VendorId),
            VariableSpec::tag("temp", "varA.memB"),
        ]);

        let commands = core.handle(Input::PollTick);
        assert_eq!(sent(&commands)[0].as_bytes()[53], 0x01);

        let commands = core.handle(Input::Frame(attribute_reply(1)));
        assert_eq!(
            crate::frame::decode_read_tag_path(sent(&commands)[0].as_bytes())
                .unwrap()
                .to_string(),
            "varA.memB"
        );

        let commands = core.handle(Input::Frame(int16_reply(123)));
        assert_eq!(commands[0], Command::PublishStatus(true));
        let cycle = flushed(commands);
        assert_eq!(
            cycle.values(),
            vec![Some(Value::UInt(1)), Some(Value::Int(123))]
        );
    }

    #[test]
    fn test_scenario_error_in_middle() {
        let mut core = connected(vec![
            VariableSpec::tag("v1", "v1"),
            VariableSpec::tag("v2", "v2"),
            VariableSpec::tag("v3", "v3"),
        ]);
        core.handle(Input::PollTick);
        core.handle(Input::Frame(int16_reply(10)));
        core.handle(Input::Frame(error_reply(0x04)));
        let cycle = flushed(core.handle(Input::Frame(int16_reply(30))));
        assert_eq!(
            cycle.values(),
            vec![Some(Value::Int(10)), None, Some(Value::Int(30))]
        );
    }

    #[test]
    fn test_sequence_increments_per_request() {
        let mut core = connected(vec![
            VariableSpec::tag("a", "a"),
            VariableSpec::attribute("s", AttributeCode::Status),
        ]);
        let first = core.handle(Input::PollTick);
        let second = core.handle(Input::Frame(int16_reply(1)));
        core.handle(Input::Frame(attribute_reply(0)));
        let third = core.handle(Input::PollTick);

        let seq = |commands: &[Command]| {
            read_u16(sent(commands)[0].as_bytes(), SEQUENCE_COUNT_INDEX).unwrap()
        };
        assert_eq!(seq(&first), INITIAL_SEQUENCE_COUNT);
        assert_eq!(seq(&second), INITIAL_SEQUENCE_COUNT + 1);
        assert_eq!(seq(&third), INITIAL_SEQUENCE_COUNT + 2);
    }

    #[test]
    fn test_blocked_ticks_publish_stalled_status() {
        let mut core = connected(vec![VariableSpec::tag("a", "a")]);
        core.handle(Input::PollTick);
        for _ in 0..4 {
            assert_eq!(
                core.handle(Input::PollTick),
                vec![Command::PublishStatus(false)]
            );
        }
        // 第 5 个 tick 放弃周期，孤儿响应到达后被丢弃，新周期立即发送
        assert_eq!(
            core.handle(Input::PollTick),
            vec![Command::PublishStatus(false)]
        );
        let commands = core.handle(Input::Frame(int16_reply(7)));
        assert_eq!(sent(&commands).len(), 1);
        let cycle = flushed(core.handle(Input::Frame(int16_reply(8))));
        assert_eq!(cycle.values(), vec![Some(Value::Int(8))]);
    }

    #[test]
    fn test_unanswered_abandoned_request_forces_reconnect() {
        let mut core = connected(vec![VariableSpec::tag("a", "a"), VariableSpec::tag("b", "b")]);
        for _ in 0..6 {
            core.handle(Input::PollTick);
        }

        // 孤儿仍未应答：拆除连接而不是在同一连接上发送新请求
        let commands = core.handle(Input::PollTick);
        assert!(sent(&commands).is_empty());
        assert_eq!(
            commands,
            vec![
                Command::PublishStatus(false),
                Command::StopPollTimer,
                Command::CloseTransport,
                Command::ArmReconnect(Duration::from_millis(5000)),
            ]
        );
        assert_eq!(core.session().state(), SessionState::Disconnected);

        // 旧连接上迟到的响应被忽略，不会进入任何周期
        assert!(core.handle(Input::Frame(int16_reply(999))).is_empty());
        assert_eq!(core.handle(Input::ReconnectElapsed), vec![Command::OpenTransport]);
    }

    #[test]
    fn test_transport_failure_tears_down_and_reconnects() {
        let mut core = connected(vec![VariableSpec::tag("a", "a")]);
        core.handle(Input::PollTick);
        let commands = core.handle(Input::TransportFailed("reset".to_string()));
        assert_eq!(
            commands,
            vec![
                Command::RaiseAlert(Alert::host_connect_error("reset")),
                Command::PublishStatus(false),
                Command::StopPollTimer,
                Command::CloseTransport,
                Command::ArmReconnect(Duration::from_millis(5000)),
            ]
        );
        assert_eq!(core.pending_timers(), 1);
        assert!(core.handle(Input::PollTick).is_empty());
        assert_eq!(
            core.session().sequence().current(),
            INITIAL_SEQUENCE_COUNT
        );
    }

    #[test]
    fn test_stop_twice_leaves_no_timers() {
        let mut core = connected(vec![VariableSpec::tag("a", "a")]);
        core.handle(Input::PollTick);
        assert_eq!(core.pending_timers(), 1);

        let commands = core.handle(Input::Stop);
        assert_eq!(
            commands,
            vec![
                Command::StopPollTimer,
                Command::CloseTransport,
                Command::PublishStatus(false),
                Command::ClearAllAlerts,
            ]
        );
        assert_eq!(core.pending_timers(), 0);

        assert_eq!(
            core.handle(Input::Stop),
            vec![Command::PublishStatus(false), Command::ClearAllAlerts]
        );
        assert_eq!(core.pending_timers(), 0);
        assert!(core.handle(Input::Frame(int16_reply(1))).is_empty());
    }

    #[test]
    fn test_stop_before_connect_completes() {
        let mut core = driver_core(vec![VariableSpec::tag("a", "a")]);
        core.handle(Input::Start);
        let commands = core.handle(Input::Stop);
        assert_eq!(commands[0], Command::CloseTransport);
        assert!(core.handle(Input::TransportConnected).is_empty());
        assert_eq!(core.pending_timers(), 0);

        let mut never_started = driver_core(vec![VariableSpec::tag("a", "a")]);
        never_started.handle(Input::Stop);
        assert_eq!(never_started.pending_timers(), 0);
    }
}
