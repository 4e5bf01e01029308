//! 模型客户端抽象
//!
//! 一次流式调用：完整对话 + system + 工具目录 + 取消令牌进，文本增量经 on_delta
//! 回调流出，最终返回结构化 ModelTurn（内容块 / 停止原因 / 用量）。

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::memory::{ContentBlock, Turn};
use crate::tools::ToolDescriptor;

/// 模型提供方错误；Cancelled 携带已流出的部分文本，供上层记录后再上抛
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider network error: {0}")]
    Network(String),

    #[error("provider rate limited")]
    RateLimited,

    #[error("provider api error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("provider response parse error: {0}")]
    Parse(String),

    #[error("provider stream cancelled")]
    Cancelled { partial: String },
}

/// 流结束的原因（边界处解析为显式变体）
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other(String),
}

impl StopReason {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            other => StopReason::Other(other.to_string()),
        }
    }
}

/// 单次调用的 token 用量
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// 模型产出的一个 assistant Turn：有序内容块 + 停止原因 + 用量
#[derive(Clone, Debug)]
pub struct ModelTurn {
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

impl ModelTurn {
    /// 拼接全部文本块
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    pub fn wants_tools(&self) -> bool {
        self.stop_reason == StopReason::ToolUse
            && self
                .blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

/// 一次流式请求的输入
pub struct ChatRequest<'a> {
    pub system: &'a str,
    pub turns: &'a [Turn],
    pub tools: &'a [ToolDescriptor],
}

/// 文本增量回调
pub type DeltaSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// 模型客户端 trait：流式产出一个 assistant Turn
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream_turn(
        &self,
        request: ChatRequest<'_>,
        on_delta: DeltaSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, ProviderError>;

    /// 累计 token 用量 (input, output, total)；默认 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
