//! 模型客户端抽象与实现
//!
//! 所有后端实现 ModelClient：stream_turn（流式，文本增量回调 + 结构化最终 Turn）。
//! - **anthropic**: Messages API（reqwest + SSE）
//! - **mock**: 回显 / 脚本客户端（测试与无 Key 环境）

pub mod anthropic;
pub mod mock;
pub mod sse;
pub mod traits;

use std::sync::Arc;

use crate::config::AppConfig;

pub use anthropic::{AnthropicClient, ProviderConfig, UsageCounters, ANTHROPIC_BASE_URL};
pub use mock::{MockModelClient, ScriptedModelClient};
pub use traits::{
    ChatRequest, DeltaSink, ModelClient, ModelTurn, ProviderError, StopReason, TokenUsage,
};

/// 根据配置与环境变量选择模型后端；无 ANTHROPIC_API_KEY 时回落 Mock
pub fn create_model_from_config(cfg: &AppConfig) -> Arc<dyn ModelClient> {
    match std::env::var("ANTHROPIC_API_KEY") {
        Ok(api_key) if !api_key.is_empty() => {
            let provider = ProviderConfig {
                base_url: cfg.llm.base_url.clone(),
                api_key,
                model: cfg.llm.model.clone(),
                max_tokens: cfg.llm.max_tokens,
                connect_timeout: std::time::Duration::from_secs(cfg.llm.timeouts.connect),
                request_timeout: std::time::Duration::from_secs(cfg.llm.timeouts.request),
            };
            tracing::info!(model = %cfg.llm.model, "using Anthropic model client");
            match AnthropicClient::new(provider) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    tracing::warn!("failed to build Anthropic client ({e}), using Mock");
                    Arc::new(MockModelClient)
                }
            }
        }
        _ => {
            tracing::warn!("ANTHROPIC_API_KEY not set, using Mock model client");
            Arc::new(MockModelClient)
        }
    }
}
