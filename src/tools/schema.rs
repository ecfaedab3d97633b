//! 工具参数 JSON Schema 生成（schemars）
//!
//! 工具用 `#[derive(JsonSchema, Deserialize)]` 声明参数结构体，由这里生成 function 的 parameters。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 由参数类型生成 function parameters schema（去掉 $schema / title 等远端不需要的顶层字段）
pub fn parameters_schema_for<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object", "properties": {} })
    });
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}
