//! 网关运行配置加载：环境变量 + 变量表文件。

use domain::VariableSpec;
use eip_protocol::DriverConfig;
use std::env;
use std::path::{Path, PathBuf};

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
    #[error("failed to read {0}: {1}")]
    Io(String, String),
    #[error("invalid variable list: {0}")]
    Variables(String),
}

/// 网关运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub connect_retry_ms: u64,
    pub max_connect_retries: u32,
    pub reconnect_interval_ms: u64,
    pub max_blocked_ticks: u32,
    pub variables_file: PathBuf,
    pub enabled: bool,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = read_required("EIP_HOST")?;
        let variables_file = PathBuf::from(read_required("EIP_VARIABLES_FILE")?);
        let defaults = DriverConfig::new(host.clone());

        Ok(Self {
            host,
            port: read_with_default("EIP_PORT", defaults.port)?,
            poll_interval_ms: read_with_default("EIP_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            connect_timeout_ms: read_with_default(
                "EIP_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout_ms,
            )?,
            connect_retry_ms: read_with_default("EIP_CONNECT_RETRY_MS", defaults.connect_retry_ms)?,
            max_connect_retries: read_with_default(
                "EIP_MAX_CONNECT_RETRIES",
                defaults.max_connect_retries,
            )?,
            reconnect_interval_ms: read_with_default(
                "EIP_RECONNECT_INTERVAL_MS",
                defaults.reconnect_interval_ms,
            )?,
            max_blocked_ticks: read_with_default(
                "EIP_MAX_BLOCKED_TICKS",
                defaults.max_blocked_ticks,
            )?,
            variables_file,
            enabled: read_bool_with_default("EIP_ENABLED", true),
        })
    }

    /// 转换为驱动配置。
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            host: self.host.clone(),
            port: self.port,
            poll_interval_ms: self.poll_interval_ms,
            connect_timeout_ms: self.connect_timeout_ms,
            connect_retry_ms: self.connect_retry_ms,
            max_connect_retries: self.max_connect_retries,
            reconnect_interval_ms: self.reconnect_interval_ms,
            max_blocked_ticks: self.max_blocked_ticks,
        }
    }

    /// 读取并校验变量表文件。
    pub fn load_variables(&self) -> Result<Vec<VariableSpec>, ConfigError> {
        load_variables(&self.variables_file)
    }
}

/// 从 JSON 文件读取变量表。
pub fn load_variables(path: &Path) -> Result<Vec<VariableSpec>, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
    parse_variables(&raw)
}

/// 解析 JSON 变量表；名称重复视为配置错误。
pub fn parse_variables(json: &str) -> Result<Vec<VariableSpec>, ConfigError> {
    let variables: Vec<VariableSpec> =
        serde_json::from_str(json).map_err(|e| ConfigError::Variables(e.to_string()))?;
    for (i, variable) in variables.iter().enumerate() {
        if variables[..i].iter().any(|other| other.name == variable.name) {
            return Err(ConfigError::Variables(format!(
                "duplicate variable name `{}`",
                variable.name
            )));
        }
    }
    Ok(variables)
}

fn read_required(key: &str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key.to_string())),
    }
}

fn read_with_default<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
