//! 周期轮询调度
//!
//! 线上没有请求关联 ID，同一连接同一时刻最多一个在途请求，响应总是属于当前游标。
//! 每个周期带一个代号；被强制放弃的周期留下的在途请求记为孤儿。新周期在孤儿的响应到达
//! （丢弃）之前不发送第一个请求；若再过一个 tick 仍未到达，只能通过重建连接保证不会有迟到帧。

use crate::decode::{decode_attribute, decode_tag_value};
use crate::error::{DecodeError, EncodeError};
use crate::frame::{EncodedRequest, response_status};
use crate::session::ConnectionSession;
use domain::{Value, VariableRequest, VariableSpec};
use std::sync::Arc;
use tracing::{debug, warn};

/// 单个变量读取失败的原因
#[derive(Debug, Clone, PartialEq)]
pub enum ReadFailure {
    /// 标签路径无法编码，未发送请求
    BadPath(EncodeError),
    /// 控制器返回非零状态
    Status(u32),
    /// 响应无法解码
    Decode(DecodeError),
}

impl ReadFailure {
    /// 是否需要对该变量告警（路径错误只记日志）
    pub fn raises_alert(&self) -> bool {
        !matches!(self, ReadFailure::BadPath(_))
    }
}

/// 单个变量在一个周期内的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    Value(Value),
    Failed(ReadFailure),
}

impl ReadResult {
    pub fn value(&self) -> Option<&Value> {
        match self {
            ReadResult::Value(value) => Some(value),
            ReadResult::Failed(_) => None,
        }
    }
}

/// 已完成的周期，结果与变量表一一对应
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedCycle {
    generation: u64,
    results: Vec<ReadResult>,
}

impl CompletedCycle {
    pub(crate) fn from_results(generation: u64, results: Vec<ReadResult>) -> Self {
        Self {
            generation,
            results,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn results(&self) -> &[ReadResult] {
        &self.results
    }

    pub fn values(&self) -> Vec<Option<Value>> {
        self.results.iter().map(|r| r.value().cloned()).collect()
    }
}

/// 调度器要求执行的动作
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// 发送当前游标的请求并等待响应
    Send(EncodedRequest),
    /// 周期结束，交给下游
    Complete(CompletedCycle),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// 上一周期仍在进行，跳过本次 tick
    Blocked { blocked: u32 },
    /// 上一周期被放弃，新周期等待孤儿响应
    Abandoned { generation: u64 },
    /// 孤儿响应未在一个 tick 内到达，需要重建连接
    OrphanExpired { generation: u64 },
    Dispatched(Dispatch),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Dispatch(Dispatch),
    /// 孤儿请求的迟到响应已丢弃；`then` 为新周期的第一个动作
    Stale { generation: u64, then: Dispatch },
    /// 没有在途请求
    Unexpected,
}

#[derive(Debug)]
struct PollCycle {
    generation: u64,
    results: Vec<ReadResult>,
    blocked: u32,
    /// 等待孤儿响应，尚未发送第一个请求
    deferred: bool,
}

impl PollCycle {
    fn cursor(&self) -> usize {
        self.results.len()
    }
}

/// 周期轮询调度器
#[derive(Debug)]
pub struct PollScheduler {
    variables: Arc<[VariableSpec]>,
    max_blocked_ticks: u32,
    next_generation: u64,
    cycle: Option<PollCycle>,
    orphan: Option<u64>,
}

impl PollScheduler {
    pub fn new(variables: Arc<[VariableSpec]>, max_blocked_ticks: u32) -> Self {
        Self {
            variables,
            max_blocked_ticks,
            next_generation: 0,
            cycle: None,
            orphan: None,
        }
    }

    pub fn variables(&self) -> &Arc<[VariableSpec]> {
        &self.variables
    }

    pub fn is_active(&self) -> bool {
        self.cycle.is_some()
    }

    /// 是否有请求在途（发送后尚未收到响应）
    pub fn awaiting_response(&self) -> bool {
        match &self.cycle {
            Some(cycle) => !cycle.deferred || self.orphan.is_some(),
            None => false,
        }
    }

    /// 连接拆除时丢弃周期与孤儿。
    pub fn reset(&mut self) {
        self.cycle = None;
        self.orphan = None;
    }

    pub fn on_tick(&mut self, session: &mut ConnectionSession) -> TickOutcome {
        match self.cycle.as_mut() {
            Some(cycle) if cycle.deferred => match self.orphan {
                // 孤儿仍可能在途，同一连接上不能再发请求
                Some(generation) => {
                    warn!(generation, "orphaned request still outstanding");
                    self.reset();
                    TickOutcome::OrphanExpired { generation }
                }
                None => {
                    cycle.deferred = false;
                    TickOutcome::Dispatched(self.advance(session))
                }
            },
            Some(cycle) if cycle.blocked <= self.max_blocked_ticks => {
                cycle.blocked += 1;
                TickOutcome::Blocked {
                    blocked: cycle.blocked,
                }
            }
            Some(cycle) => {
                let abandoned = cycle.generation;
                warn!(
                    generation = abandoned,
                    cursor = cycle.cursor(),
                    "poll cycle stalled, abandoning"
                );
                self.orphan = Some(abandoned);
                let mut next = self.new_cycle();
                next.deferred = true;
                self.cycle = Some(next);
                TickOutcome::Abandoned {
                    generation: abandoned,
                }
            }
            None => {
                self.cycle = Some(self.new_cycle());
                TickOutcome::Dispatched(self.advance(session))
            }
        }
    }

    pub fn on_response(&mut self, frame: &[u8], session: &mut ConnectionSession) -> ResponseOutcome {
        let Some(cycle) = self.cycle.as_mut() else {
            return ResponseOutcome::Unexpected;
        };

        if cycle.deferred {
            let Some(generation) = self.orphan.take() else {
                return ResponseOutcome::Unexpected;
            };
            debug!(generation, "dropping late response of abandoned cycle");
            cycle.deferred = false;
            let then = self.advance(session);
            return ResponseOutcome::Stale { generation, then };
        }

        let Some(variable) = self.variables.get(cycle.cursor()) else {
            return ResponseOutcome::Unexpected;
        };
        let result = read_result(&variable.request, frame);
        if let ReadResult::Failed(failure) = &result {
            debug!(variable = %variable.name, ?failure, "variable read failed");
        }
        cycle.results.push(result);
        ResponseOutcome::Dispatch(self.advance(session))
    }

    fn new_cycle(&mut self) -> PollCycle {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        PollCycle {
            generation,
            results: Vec::with_capacity(self.variables.len()),
            blocked: 0,
            deferred: false,
        }
    }

    /// 从游标向前扫描，找到第一个能编码的变量；扫到末尾则周期完成。
    fn advance(&mut self, session: &mut ConnectionSession) -> Dispatch {
        let Some(cycle) = self.cycle.as_mut() else {
            return Dispatch::Complete(CompletedCycle::from_results(
                self.next_generation,
                Vec::new(),
            ));
        };

        while let Some(variable) = self.variables.get(cycle.cursor()) {
            match session.encode_read(&variable.request) {
                Ok(request) => return Dispatch::Send(request),
                Err(e) => {
                    warn!(variable = %variable.name, error = %e, "skipping variable");
                    eip_telemetry::record_path_encode_failure();
                    cycle.results.push(ReadResult::Failed(ReadFailure::BadPath(e)));
                }
            }
        }

        let generation = cycle.generation;
        let results = std::mem::take(&mut cycle.results);
        self.cycle = None;
        Dispatch::Complete(CompletedCycle::from_results(generation, results))
    }
}

fn read_result(request: &VariableRequest, frame: &[u8]) -> ReadResult {
    let status = match response_status(frame) {
        Ok(status) => status,
        Err(e) => return ReadResult::Failed(ReadFailure::Decode(e)),
    };
    if status != 0 {
        return ReadResult::Failed(ReadFailure::Status(status));
    }
    let decoded = match request {
        VariableRequest::Attribute(code) => decode_attribute(*code, frame),
        VariableRequest::Tag(_) => decode_tag_value(frame),
    };
    match decoded {
        Ok(value) => ReadResult::Value(value),
        Err(e) => ReadResult::Failed(ReadFailure::Decode(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DATA_INDEX, DATA_TYPE_INDEX, RESPONSE_STATUS_INDEX};
    use domain::AttributeCode;

    fn connected_session() -> ConnectionSession {
        let mut session = ConnectionSession::new(25);
        session.begin_registration();
        session.on_handshake_frame(&[0u8; 28]);
        let mut reply = vec![0u8; 48];
        reply[44..48].copy_from_slice(&[1, 2, 3, 4]);
        session.on_handshake_frame(&reply);
        assert!(session.is_connected());
        session
    }

    fn int16_reply(value: i16) -> Vec<u8> {
        let mut frame = vec![0u8; DATA_INDEX];
        frame[DATA_TYPE_INDEX] = 0xC3;
        frame.extend_from_slice(&value.to_le_bytes());
        frame
    }

    fn error_reply(status: u32) -> Vec<u8> {
        let mut frame = vec![0u8; DATA_INDEX];
        frame[RESPONSE_STATUS_INDEX..RESPONSE_STATUS_INDEX + 4].copy_from_slice(&status.to_le_bytes());
        frame
    }

    fn scheduler(variables: Vec<VariableSpec>) -> PollScheduler {
        PollScheduler::new(variables.into(), 3)
    }

    fn expect_send(outcome: TickOutcome) -> EncodedRequest {
        match outcome {
            TickOutcome::Dispatched(Dispatch::Send(request)) => request,
            other => panic!("expected send, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_with_error_in_middle() {
        let mut session = connected_session();
        let mut sched = scheduler(vec![
            VariableSpec::tag("a", "a"),
            VariableSpec::tag("b", "b"),
            VariableSpec::tag("c", "c"),
        ]);

        expect_send(sched.on_tick(&mut session));
        assert!(matches!(
            sched.on_response(&int16_reply(1), &mut session),
            ResponseOutcome::Dispatch(Dispatch::Send(_))
        ));
        assert!(matches!(
            sched.on_response(&error_reply(0x05), &mut session),
            ResponseOutcome::Dispatch(Dispatch::Send(_))
        ));
        let ResponseOutcome::Dispatch(Dispatch::Complete(done)) =
            sched.on_response(&int16_reply(3), &mut session)
        else {
            panic!("cycle should complete");
        };
        assert_eq!(
            done.values(),
            vec![Some(Value::Int(1)), None, Some(Value::Int(3))]
        );
        assert_eq!(done.results()[1], ReadResult::Failed(ReadFailure::Status(5)));
        assert!(!sched.is_active());
    }

    #[test]
    fn test_bad_paths_are_skipped_without_sending() {
        let mut session = connected_session();
        let mut sched = scheduler(vec![
            VariableSpec::tag("bad", "x[1"),
            VariableSpec::attribute("vendor", AttributeCode::VendorId),
            VariableSpec::tag("bad2", "y..z"),
        ]);

        expect_send(sched.on_tick(&mut session));
        let mut reply = vec![0u8; 50];
        reply.extend_from_slice(&[0x2A, 0x00]);
        let ResponseOutcome::Dispatch(Dispatch::Complete(done)) =
            sched.on_response(&reply, &mut session)
        else {
            panic!("cycle should complete");
        };
        assert_eq!(done.values(), vec![None, Some(Value::UInt(42)), None]);
        assert!(matches!(
            done.results()[0],
            ReadResult::Failed(ReadFailure::BadPath(_))
        ));
    }

    #[test]
    fn test_all_bad_paths_complete_immediately() {
        let mut session = connected_session();
        let mut sched = scheduler(vec![VariableSpec::tag("bad", "]")]);
        let TickOutcome::Dispatched(Dispatch::Complete(done)) = sched.on_tick(&mut session) else {
            panic!("cycle should complete on the tick");
        };
        assert_eq!(done.values(), vec![None]);
        assert!(!sched.is_active());
    }

    #[test]
    fn test_decode_failure_yields_none() {
        let mut session = connected_session();
        let mut sched = scheduler(vec![VariableSpec::tag("a", "a")]);
        expect_send(sched.on_tick(&mut session));
        let mut frame = vec![0u8; DATA_INDEX];
        frame[DATA_TYPE_INDEX] = 0x42;
        let ResponseOutcome::Dispatch(Dispatch::Complete(done)) =
            sched.on_response(&frame, &mut session)
        else {
            panic!("cycle should complete");
        };
        assert_eq!(
            done.results()[0],
            ReadResult::Failed(ReadFailure::Decode(DecodeError::UnknownType(0x42)))
        );
    }

    #[test]
    fn test_blocked_ticks_then_abandon_and_stale_drop() {
        let mut session = connected_session();
        let mut sched = scheduler(vec![VariableSpec::tag("a", "a"), VariableSpec::tag("b", "b")]);

        expect_send(sched.on_tick(&mut session));
        for blocked in 1..=4 {
            assert_eq!(sched.on_tick(&mut session), TickOutcome::Blocked { blocked });
        }
        assert_eq!(
            sched.on_tick(&mut session),
            TickOutcome::Abandoned { generation: 0 }
        );
        assert!(sched.awaiting_response());

        // 迟到响应属于第 0 代，被丢弃，新周期随即发送第一个请求
        let outcome = sched.on_response(&int16_reply(99), &mut session);
        let ResponseOutcome::Stale { generation, then } = outcome else {
            panic!("expected stale drop, got {:?}", outcome);
        };
        assert_eq!(generation, 0);
        assert!(matches!(then, Dispatch::Send(_)));

        sched.on_response(&int16_reply(1), &mut session);
        let ResponseOutcome::Dispatch(Dispatch::Complete(done)) =
            sched.on_response(&int16_reply(2), &mut session)
        else {
            panic!("cycle should complete");
        };
        assert_eq!(done.generation(), 1);
        assert_eq!(done.values(), vec![Some(Value::Int(1)), Some(Value::Int(2))]);
    }

    #[test]
    fn test_unanswered_orphan_never_shares_the_connection() {
        let mut session = connected_session();
        let mut sched = scheduler(vec![VariableSpec::tag("a", "a"), VariableSpec::tag("b", "b")]);

        expect_send(sched.on_tick(&mut session));
        for _ in 0..4 {
            sched.on_tick(&mut session);
        }
        assert!(matches!(
            sched.on_tick(&mut session),
            TickOutcome::Abandoned { .. }
        ));
        let sequence = session.sequence();

        // 孤儿一个 tick 内未应答：不发送新请求，周期整体丢弃
        assert_eq!(
            sched.on_tick(&mut session),
            TickOutcome::OrphanExpired { generation: 0 }
        );
        assert_eq!(session.sequence(), sequence);
        assert!(!sched.is_active());
        assert!(!sched.awaiting_response());

        // 迟到的孤儿响应不会落到任何周期里
        assert_eq!(
            sched.on_response(&int16_reply(999), &mut session),
            ResponseOutcome::Unexpected
        );
    }

    #[test]
    fn test_unexpected_response_and_reset() {
        let mut session = connected_session();
        let mut sched = scheduler(vec![VariableSpec::tag("a", "a")]);
        assert_eq!(
            sched.on_response(&int16_reply(1), &mut session),
            ResponseOutcome::Unexpected
        );
        expect_send(sched.on_tick(&mut session));
        sched.reset();
        assert!(!sched.is_active());
        assert!(!sched.awaiting_response());
    }
}
