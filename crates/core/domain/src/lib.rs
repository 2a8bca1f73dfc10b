pub mod data;
pub mod variable;

pub use data::Value;
pub use variable::{AttributeCode, TagRef, VariableRequest, VariableSpec, VariableSpecError};
