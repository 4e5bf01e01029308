//! Agent 错误类型
//!
//! 分层汇聚：通道 / 提供方 / 校验错误在各自模块定义，这里是编排器与网关向调用方
//! 暴露的伞型错误。工具调用级错误不会出现在这里——它们一律折叠成 tool_result
//! 块回给模型；只有连接期与模型流级别的失败才作为硬错误上抛。

use thiserror::Error;

use crate::llm::ProviderError;
use crate::tools::ChannelError;

/// 编排与多路复用过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("model provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("tool channel error: {0}")]
    Channel(#[from] ChannelError),

    /// 用户中止当前请求
    #[error("cancelled")]
    Cancelled,

    /// 单次 chat 的循环安全阀触发（模型持续要求调用工具）
    #[error("agent loop exceeded {0} iterations")]
    IterationLimit(usize),

    #[error("config error: {0}")]
    Config(String),

    #[error("session store error: {0}")]
    Store(String),

    /// 网关容量已满且无可驱逐的空闲会话
    #[error("gateway at capacity")]
    AtCapacity,
}
