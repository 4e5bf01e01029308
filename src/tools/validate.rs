//! 工具参数校验
//!
//! 调度前根据 ToolDescriptor 的形状校验模型给出的参数：必须是单个 JSON 对象、
//! 序列化体积受上限保护、必填键齐全、未声明键按 schema 拒绝、每个已声明属性
//! 至少匹配一个声明类型。整数与浮点按「有限且无小数部分」区分，而非只看标签。
//! 校验只报错，从不悄悄修正。

use serde_json::Value;
use thiserror::Error;

use crate::tools::catalog::{JsonType, ToolDescriptor};

/// 参数体积硬上限的默认值（字节）
pub const DEFAULT_MAX_ARG_BYTES: usize = 32 * 1024;

/// 参数校验失败：指明工具与违规键，便于模型在同轮自我纠正
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("tool {tool}: arguments must be a single JSON object")]
    NotAnObject { tool: String },

    #[error("tool {tool}: serialized arguments exceed {limit} bytes")]
    TooLarge { tool: String, limit: usize },

    #[error("tool {tool}: missing required argument '{key}'")]
    MissingRequired { tool: String, key: String },

    #[error("tool {tool}: unexpected argument '{key}'")]
    UnexpectedKey { tool: String, key: String },

    #[error("tool {tool}: argument '{key}' does not match declared type ({expected})")]
    TypeMismatch {
        tool: String,
        key: String,
        expected: String,
    },
}

/// 校验一次候选调用的参数；任何违规立即返回描述性错误
pub fn validate_args(
    descriptor: &ToolDescriptor,
    args: &Value,
    max_bytes: usize,
) -> Result<(), ValidationError> {
    let tool = descriptor.name.as_str();

    let obj = match args {
        Value::Object(map) => map,
        _ => {
            return Err(ValidationError::NotAnObject {
                tool: tool.to_string(),
            })
        }
    };

    let serialized_len = args.to_string().len();
    if serialized_len > max_bytes {
        return Err(ValidationError::TooLarge {
            tool: tool.to_string(),
            limit: max_bytes,
        });
    }

    let shape = &descriptor.shape;

    for key in &shape.required {
        if !obj.contains_key(key) {
            return Err(ValidationError::MissingRequired {
                tool: tool.to_string(),
                key: key.clone(),
            });
        }
    }

    if !shape.additional_properties {
        for key in obj.keys() {
            if !shape.properties.contains_key(key) {
                return Err(ValidationError::UnexpectedKey {
                    tool: tool.to_string(),
                    key: key.clone(),
                });
            }
        }
    }

    for (key, value) in obj {
        let Some(prop) = shape.properties.get(key) else {
            continue;
        };
        if prop.types.is_empty() {
            continue;
        }
        if !prop.types.iter().any(|t| matches_type(value, *t)) {
            let expected = prop
                .types
                .iter()
                .map(JsonType::as_str)
                .collect::<Vec<_>>()
                .join(" | ");
            return Err(ValidationError::TypeMismatch {
                tool: tool.to_string(),
                key: key.clone(),
                expected,
            });
        }
    }

    Ok(())
}

/// integer 按数值判定：有限且无小数部分即可（1.0 算整数，1.5 不算）
fn matches_type(value: &Value, ty: JsonType) -> bool {
    match ty {
        JsonType::String => value.is_string(),
        JsonType::Boolean => value.is_boolean(),
        JsonType::Object => value.is_object(),
        JsonType::Array => value.is_array(),
        JsonType::Null => value.is_null(),
        JsonType::Number => value.is_number(),
        JsonType::Integer => {
            value.is_i64()
                || value.is_u64()
                || value
                    .as_f64()
                    .map(|f| f.is_finite() && f.fract() == 0.0)
                    .unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(additional: bool) -> ToolDescriptor {
        ToolDescriptor::new(
            "list_x",
            "list things",
            json!({
                "type": "object",
                "required": ["a"],
                "properties": {"a": {"type": "integer"}},
                "additionalProperties": additional
            }),
        )
    }

    #[test]
    fn test_missing_required_rejected() {
        let err = validate_args(&descriptor(true), &json!({}), DEFAULT_MAX_ARG_BYTES).unwrap_err();
        assert!(matches!(err, ValidationError::MissingRequired { ref key, .. } if key == "a"));
    }

    #[test]
    fn test_non_integer_rejected() {
        let err =
            validate_args(&descriptor(true), &json!({"a": 1.5}), DEFAULT_MAX_ARG_BYTES).unwrap_err();
        assert!(matches!(err, ValidationError::TypeMismatch { ref key, .. } if key == "a"));
    }

    #[test]
    fn test_integer_accepted() {
        validate_args(&descriptor(true), &json!({"a": 1}), DEFAULT_MAX_ARG_BYTES).unwrap();
        // 数值上为整的浮点同样接受
        validate_args(&descriptor(true), &json!({"a": 2.0}), DEFAULT_MAX_ARG_BYTES).unwrap();
    }

    #[test]
    fn test_additional_properties_policy() {
        validate_args(
            &descriptor(true),
            &json!({"a": 1, "b": 2}),
            DEFAULT_MAX_ARG_BYTES,
        )
        .unwrap();
        let err = validate_args(
            &descriptor(false),
            &json!({"a": 1, "b": 2}),
            DEFAULT_MAX_ARG_BYTES,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::UnexpectedKey { ref key, .. } if key == "b"));
    }

    #[test]
    fn test_non_object_rejected() {
        for payload in [json!([1, 2]), json!("x"), json!(3)] {
            let err = validate_args(&descriptor(true), &payload, DEFAULT_MAX_ARG_BYTES).unwrap_err();
            assert!(matches!(err, ValidationError::NotAnObject { .. }));
        }
    }

    #[test]
    fn test_size_ceiling() {
        let big = json!({"a": 1, "blob": "x".repeat(100)});
        let err = validate_args(&descriptor(true), &big, 32).unwrap_err();
        assert!(matches!(err, ValidationError::TooLarge { limit: 32, .. }));
    }

    #[test]
    fn test_undeclared_type_accepts_anything() {
        let desc = ToolDescriptor::new("free", "", json!({"type": "object"}));
        validate_args(&desc, &json!({"whatever": [1, {"k": true}]}), DEFAULT_MAX_ARG_BYTES).unwrap();
    }
}
