//! 现场网关采集进程：加载配置、启动 EtherNet/IP 驱动，Ctrl-C 时停止。

use async_trait::async_trait;
use domain::{Value, VariableSpec};
use eip_config::AppConfig;
use eip_protocol::{EipDriver, ResultSink, SinkError, TracingAlertSink, WatchConnectivity};
use eip_telemetry::{init_tracing, metrics};
use std::sync::Arc;
use tracing::{info, warn};

/// 以日志形式输出每个周期的结果（持久化由下游服务负责）。
struct LogResultSink;

#[async_trait]
impl ResultSink for LogResultSink {
    async fn deliver(
        &self,
        variable: &VariableSpec,
        value: Option<&Value>,
    ) -> Result<(), SinkError> {
        let rendered = match value {
            Some(value) => {
                serde_json::to_string(value).map_err(|e| SinkError::Write(e.to_string()))?
            }
            None => "null".to_string(),
        };
        info!(target: "eip.gateway", variable = %variable.name, value = %rendered, "value");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = AppConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();

    if !config.enabled {
        info!(host = %config.host, "driver disabled, nothing to do");
        return Ok(());
    }

    let variables = config.load_variables()?;
    let (status, mut connectivity) = WatchConnectivity::new();
    let mut driver = EipDriver::new(
        config.driver_config(),
        variables,
        Arc::new(LogResultSink),
        Arc::new(TracingAlertSink::new()),
        Arc::new(status),
    );
    driver.start()?;

    // 连通性变化写日志，直到收到 Ctrl-C
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for ctrl-c");
                }
                break;
            }
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let connected = *connectivity.borrow_and_update();
                info!(connected, "controller connectivity changed");
            }
        }
    }

    driver.stop().await;
    let snapshot = metrics().snapshot();
    info!(
        frames_sent = snapshot.frames_sent,
        frames_received = snapshot.frames_received,
        cycles_completed = snapshot.cycles_completed,
        cycles_abandoned = snapshot.cycles_abandoned,
        reconnects = snapshot.reconnects_scheduled,
        "gateway stopped"
    );
    Ok(())
}
