//! Hive - Rust 多租户对话编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量，一次构造处处传入）
//! - **core**: 错误类型与对话编排主控循环
//! - **gateway**: 多租户会话多路复用（句柄生命周期、串行、容量回收）
//! - **llm**: 模型客户端抽象与实现（Anthropic Messages / Mock）
//! - **memory**: 对话数据模型、配对账本与磁盘会话
//! - **observability**: 日志初始化
//! - **tools**: 工具目录、参数校验、MCP 通道与重试调用

pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
