use serde::Serialize;

/// 控制器读回的值。
///
/// 标量与数组共用一个类型；数组元素总是同一种标量。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Array(Vec<Value>),
}
