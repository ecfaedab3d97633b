//! 工具：Tool / LogicUnit 契约、注册表、执行器与参数 schema

pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

pub use echo::EchoTool;
pub use executor::{serialize_result, ToolExecutor};
pub use registry::{LogicUnit, Tool, ToolDefinition, ToolRegistry, ToolSet};
pub use schema::parameters_schema_for;
