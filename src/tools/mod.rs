//! 工具层
//!
//! - **catalog**: 工具目录数据模型（描述符 / 校验形状 / 调用产出）
//! - **validate**: 调度前参数校验
//! - **channel**: MCP stdio 工具通道（连接 / 单发调用 / 断开）
//! - **invoker**: 传输类失败的有限指数退避重试

pub mod catalog;
pub mod channel;
pub mod invoker;
pub mod validate;

pub use catalog::{JsonType, PropertyShape, ToolCallResult, ToolContent, ToolDescriptor, ToolOutput, ToolShape};
pub use channel::{ChannelConfig, ChannelError, McpChannel, ToolChannel};
pub use invoker::RetryingInvoker;
pub use validate::{validate_args, ValidationError, DEFAULT_MAX_ARG_BYTES};
