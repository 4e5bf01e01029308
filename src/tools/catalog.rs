//! 工具目录数据模型
//!
//! 连接时从工具提供方拉取一次目录，在边界处解析为内部类型：原始 JSON Schema
//! 保留用于转发给模型，同时解析出用于参数校验的形状（required / 属性类型 /
//! 是否允许未声明键）。调用结果同样在边界处解析为带标签的内容变体。

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 一个可调用工具：名称、描述、原始 schema 与解析后的校验形状。
/// 连接期间不可变；变更目录需要断开重连。
#[derive(Clone, Debug)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// 提供方声明的原始 JSON Schema，原样转发给模型
    pub input_schema: Value,
    /// 连接时解析一次的校验形状
    pub shape: ToolShape,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        let shape = ToolShape::from_schema(&input_schema);
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            shape,
        }
    }
}

/// JSON 基本类型标签
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JsonType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl JsonType {
    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "string" => Some(JsonType::String),
            "number" => Some(JsonType::Number),
            "integer" => Some(JsonType::Integer),
            "boolean" => Some(JsonType::Boolean),
            "object" => Some(JsonType::Object),
            "array" => Some(JsonType::Array),
            "null" => Some(JsonType::Null),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Integer => "integer",
            JsonType::Boolean => "boolean",
            JsonType::Object => "object",
            JsonType::Array => "array",
            JsonType::Null => "null",
        }
    }
}

/// 单个属性的声明：接受的类型集合；空集合表示不限类型
#[derive(Clone, Debug, Default)]
pub struct PropertyShape {
    pub types: Vec<JsonType>,
}

/// 工具参数的校验形状（从 JSON Schema 宽容解析）
#[derive(Clone, Debug, Default)]
pub struct ToolShape {
    pub required: Vec<String>,
    pub properties: BTreeMap<String, PropertyShape>,
    pub additional_properties: bool,
}

impl ToolShape {
    /// 宽容解析：缺失的段落取默认值（无必填、无属性声明、允许附加键）
    pub fn from_schema(schema: &Value) -> Self {
        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut properties = BTreeMap::new();
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (key, prop) in props {
                let types = match prop.get("type") {
                    Some(Value::String(tag)) => JsonType::parse(tag).into_iter().collect(),
                    Some(Value::Array(tags)) => tags
                        .iter()
                        .filter_map(Value::as_str)
                        .filter_map(JsonType::parse)
                        .collect(),
                    _ => Vec::new(),
                };
                properties.insert(key.clone(), PropertyShape { types });
            }
        }

        // additionalProperties 缺省为 true（JSON Schema 语义）
        let additional_properties = schema
            .get("additionalProperties")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        Self {
            required,
            properties,
            additional_properties,
        }
    }
}

/// 工具返回的内容部件：边界处解析一次的带标签变体
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ToolContent {
    Text(String),
    Structured(Value),
}

/// 一次工具调用在传输层成功后的产出
#[derive(Clone, Debug, Default)]
pub struct ToolOutput {
    pub content: Vec<ToolContent>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text(content.into())],
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text(content.into())],
            is_error: true,
        }
    }

    /// 拼接全部文本部件；结构化部件以紧凑 JSON 形式并入
    pub fn concatenated_text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            match part {
                ToolContent::Text(t) => out.push_str(t),
                ToolContent::Structured(v) => out.push_str(&v.to_string()),
            }
        }
        out
    }
}

/// 一次工具调用的完整记录：实际发送的参数、拼接文本、错误标记与耗时。
/// 编排器消费一次，观测回调可另行消费。
#[derive(Clone, Debug)]
pub struct ToolCallResult {
    pub name: String,
    pub args: Value,
    pub content: String,
    pub is_error: bool,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shape_from_schema() {
        let schema = json!({
            "type": "object",
            "required": ["a"],
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": ["string", "null"]}
            },
            "additionalProperties": false
        });
        let shape = ToolShape::from_schema(&schema);
        assert_eq!(shape.required, vec!["a"]);
        assert_eq!(shape.properties["a"].types, vec![JsonType::Integer]);
        assert_eq!(
            shape.properties["b"].types,
            vec![JsonType::String, JsonType::Null]
        );
        assert!(!shape.additional_properties);
    }

    #[test]
    fn test_shape_defaults_are_permissive() {
        let shape = ToolShape::from_schema(&json!({"type": "object"}));
        assert!(shape.required.is_empty());
        assert!(shape.properties.is_empty());
        assert!(shape.additional_properties);
    }

    #[test]
    fn test_concatenated_text() {
        let out = ToolOutput {
            content: vec![
                ToolContent::Text("a".into()),
                ToolContent::Structured(json!({"k": 1})),
                ToolContent::Text("b".into()),
            ],
            is_error: false,
        };
        assert_eq!(out.concatenated_text(), r#"a{"k":1}b"#);
    }
}
