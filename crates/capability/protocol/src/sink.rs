//! 结果下游、告警与连通性发布
//!
//! 驱动核心只通过这三个接口与外部协作，实现方负责持久化、告警登记与状态展示。

use crate::error::SinkError;
use crate::scheduler::{CompletedCycle, ReadFailure, ReadResult};
use async_trait::async_trait;
use domain::{Value, VariableSpec};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{RwLock, watch};
use tracing::{info, warn};

pub const HOST_CONNECT_ERROR: &str = "host-connect-error";
pub const PLC_REGISTER_ERROR: &str = "plc-register-error";
pub const PLC_CONNECT_ERROR: &str = "plc-connect-error";
pub const DATABASE_ERROR: &str = "database-error";

/// 结构化告警
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub key: String,
    pub msg: String,
    pub description: String,
}

impl Alert {
    pub fn host_connect_error(error: &str) -> Self {
        Self {
            key: HOST_CONNECT_ERROR.to_string(),
            msg: "Ethernet/IP: Failed to Connect to Host".to_string(),
            description: format!(
                "Error connecting to the controller at the specified host name or IP address. Error: {}. Check the connection to the controller and its settings.",
                error
            ),
        }
    }

    pub fn plc_register_error() -> Self {
        Self {
            key: PLC_REGISTER_ERROR.to_string(),
            msg: "Ethernet/IP: Failed to Register Session".to_string(),
            description:
                "Failed to register a session with the controller. Check the controller settings."
                    .to_string(),
        }
    }

    pub fn plc_connect_error() -> Self {
        Self {
            key: PLC_CONNECT_ERROR.to_string(),
            msg: "Ethernet/IP: Failed to Connect to Controller".to_string(),
            description: "Failed to connect to the controller. Check the controller settings."
                .to_string(),
        }
    }

    pub fn read_fail(variable: &VariableSpec) -> Self {
        Self {
            key: variable.read_fail_key(),
            msg: "Ethernet/IP: Read Failed for Variable".to_string(),
            description: format!(
                "Read failed for variable '{}'. Check that this variable is defined correctly in the machine.",
                variable.name
            ),
        }
    }

    pub fn database_error(error: &str) -> Self {
        Self {
            key: DATABASE_ERROR.to_string(),
            msg: "Ethernet/IP: Error Writing to Database".to_string(),
            description: format!(
                "An error occurred writing a variable value to the database. Error: {}",
                error
            ),
        }
    }
}

/// 结果下游：每个完成的周期按变量顺序逐个调用一次，不可读的变量传 `None`。
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, variable: &VariableSpec, value: Option<&Value>)
    -> Result<(), SinkError>;
}

/// 告警登记
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
    fn clear(&self, key: &str);
    fn clear_all(&self);
}

/// 连通性发布（fire-and-forget）
pub trait ConnectivityPublisher: Send + Sync {
    fn publish_status(&self, connected: bool);
}

/// 把已完成周期的结果交给下游，并维护 read-fail 与 database-error 告警。
pub async fn flush_cycle(
    variables: &[VariableSpec],
    cycle: &CompletedCycle,
    results: &dyn ResultSink,
    alerts: &dyn AlertSink,
) {
    for (variable, result) in variables.iter().zip(cycle.results()) {
        if let ReadResult::Failed(failure) = result {
            match failure {
                ReadFailure::Status(_) => eip_telemetry::record_read_failure(),
                ReadFailure::Decode(_) => eip_telemetry::record_decode_failure(),
                ReadFailure::BadPath(_) => {}
            }
            if failure.raises_alert() {
                alerts.raise(Alert::read_fail(variable));
            }
        }

        let value = result.value();
        let outcome = results.deliver(variable, value).await;
        if value.is_some() {
            alerts.clear(&variable.read_fail_key());
        }
        match outcome {
            Ok(()) => alerts.clear(DATABASE_ERROR),
            Err(e) => {
                warn!(variable = %variable.name, error = %e, "failed to deliver result");
                eip_telemetry::record_sink_write_failure();
                alerts.raise(Alert::database_error(&e.to_string()));
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 以日志输出告警，同一键只在首次激活与清除时记录。
#[derive(Debug, Default)]
pub struct TracingAlertSink {
    active: Mutex<HashSet<String>>,
}

impl TracingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, key: &str) -> bool {
        lock(&self.active).contains(key)
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.active).iter().cloned().collect();
        keys.sort();
        keys
    }
}

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: Alert) {
        if lock(&self.active).insert(alert.key.clone()) {
            warn!(key = %alert.key, description = %alert.description, "{}", alert.msg);
        }
    }

    fn clear(&self, key: &str) {
        if lock(&self.active).remove(key) {
            info!(key = %key, "alert cleared");
        }
    }

    fn clear_all(&self) {
        let mut active = lock(&self.active);
        if !active.is_empty() {
            info!(count = active.len(), "all alerts cleared");
            active.clear();
        }
    }
}

/// 内存结果下游：保存每个变量的最新值与交付记录。
#[derive(Debug, Default)]
pub struct InMemoryResultSink {
    latest: RwLock<HashMap<String, Option<Value>>>,
    deliveries: RwLock<Vec<(String, Option<Value>)>>,
}

impl InMemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn latest(&self, name: &str) -> Option<Value> {
        self.latest.read().await.get(name).cloned().flatten()
    }

    pub async fn deliveries(&self) -> Vec<(String, Option<Value>)> {
        self.deliveries.read().await.clone()
    }
}

#[async_trait]
impl ResultSink for InMemoryResultSink {
    async fn deliver(
        &self,
        variable: &VariableSpec,
        value: Option<&Value>,
    ) -> Result<(), SinkError> {
        self.latest
            .write()
            .await
            .insert(variable.name.clone(), value.cloned());
        self.deliveries
            .write()
            .await
            .push((variable.name.clone(), value.cloned()));
        Ok(())
    }
}

/// 通过 `tokio::sync::watch` 发布连通性
#[derive(Debug)]
pub struct WatchConnectivity {
    tx: watch::Sender<bool>,
}

impl WatchConnectivity {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl ConnectivityPublisher for WatchConnectivity {
    fn publish_status(&self, connected: bool) {
        // 只在状态变化时唤醒订阅者
        self.tx.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }
}
