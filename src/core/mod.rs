//! 核心：错误类型与对话编排
//!
//! - **error**: 编排器 / 网关向调用方暴露的伞型错误
//! - **orchestrator**: 流式 + 工具调度主控循环

pub mod error;
pub mod orchestrator;

pub use error::AgentError;
pub use orchestrator::{
    AgentEvent, ConversationOrchestrator, DispatchHook, HookDecision, OrchestratorConfig,
};
