//! 采集变量定义。
//!
//! 一个变量要么读取设备身份属性，要么读取控制器标签，二者互斥。

use serde::Deserialize;

/// 变量表校验错误。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariableSpecError {
    #[error("variable name is empty")]
    EmptyName,
    #[error("variable {0}: exactly one of `attribute` or `tag` is required")]
    AmbiguousRequest(String),
    #[error("variable {0}: tag path is empty")]
    EmptyTag(String),
    #[error("variable {0}: program scope requires a program name")]
    MissingProgramName(String),
}

/// 设备身份属性（Identity 对象属性号）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeCode {
    #[serde(alias = "vendor ID")]
    VendorId,
    #[serde(alias = "device type")]
    DeviceType,
    #[serde(alias = "product code")]
    ProductCode,
    Revision,
    Status,
    #[serde(alias = "serial number")]
    SerialNumber,
    #[serde(alias = "product name")]
    ProductName,
}

impl AttributeCode {
    /// 线上属性号。
    pub fn code(self) -> u8 {
        match self {
            AttributeCode::VendorId => 0x01,
            AttributeCode::DeviceType => 0x02,
            AttributeCode::ProductCode => 0x03,
            AttributeCode::Revision => 0x04,
            AttributeCode::Status => 0x05,
            AttributeCode::SerialNumber => 0x06,
            AttributeCode::ProductName => 0x07,
        }
    }
}

/// 标签引用（可带程序作用域）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRef {
    pub path: String,
    pub program: Option<String>,
}

impl TagRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            program: None,
        }
    }

    pub fn in_program(path: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            program: Some(program.into()),
        }
    }

    /// 实际发送到控制器的路径；程序作用域标签前置 `Program:<name>` 段。
    pub fn effective_path(&self) -> String {
        match &self.program {
            Some(program) => format!("Program:{}.{}", program, self.path),
            None => self.path.clone(),
        }
    }
}

/// 单个变量的请求形态。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableRequest {
    Attribute(AttributeCode),
    Tag(TagRef),
}

/// 采集变量。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawVariableSpec")]
pub struct VariableSpec {
    pub name: String,
    pub request: VariableRequest,
    pub is_array: bool,
}

impl VariableSpec {
    pub fn attribute(name: impl Into<String>, code: AttributeCode) -> Self {
        Self {
            name: name.into(),
            request: VariableRequest::Attribute(code),
            is_array: false,
        }
    }

    pub fn tag(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request: VariableRequest::Tag(TagRef::new(path)),
            is_array: false,
        }
    }

    /// 该变量读取失败时使用的告警键。
    pub fn read_fail_key(&self) -> String {
        format!("read-fail-{}", self.name)
    }
}

/// 变量表文件中的原始形态。
#[derive(Debug, Deserialize)]
struct RawVariableSpec {
    name: String,
    #[serde(default)]
    attribute: Option<AttributeCode>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default, alias = "is_array")]
    array: bool,
    #[serde(default)]
    program_scope: bool,
    #[serde(default)]
    program_name: Option<String>,
}

impl TryFrom<RawVariableSpec> for VariableSpec {
    type Error = VariableSpecError;

    fn try_from(raw: RawVariableSpec) -> Result<Self, Self::Error> {
        let name = raw.name.trim().to_string();
        if name.is_empty() {
            return Err(VariableSpecError::EmptyName);
        }

        let request = match (raw.attribute, raw.tag) {
            (Some(code), None) => VariableRequest::Attribute(code),
            (None, Some(path)) => {
                if path.trim().is_empty() {
                    return Err(VariableSpecError::EmptyTag(name));
                }
                let program = if raw.program_scope {
                    match raw.program_name.filter(|p| !p.trim().is_empty()) {
                        Some(program) => Some(program),
                        None => return Err(VariableSpecError::MissingProgramName(name)),
                    }
                } else {
                    None
                };
                VariableRequest::Tag(TagRef { path, program })
            }
            _ => return Err(VariableSpecError::AmbiguousRequest(name)),
        };

        Ok(Self {
            name,
            request,
            is_array: raw.array,
        })
    }
}
