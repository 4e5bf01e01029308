//! Mock 模型客户端（无需 API）
//!
//! MockModelClient 回显最后一条用户文本，便于无 Key 环境跑通整条链路；
//! ScriptedModelClient 按脚本依次吐出预设 ModelTurn，供编排器测试使用。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::traits::{
    ChatRequest, DeltaSink, ModelClient, ModelTurn, ProviderError, StopReason, TokenUsage,
};
use crate::memory::{ContentBlock, Role};

/// 回显客户端：取最后一条 user 文本原样返回
#[derive(Debug, Default)]
pub struct MockModelClient;

#[async_trait]
impl ModelClient for MockModelClient {
    async fn stream_turn(
        &self,
        request: ChatRequest<'_>,
        on_delta: DeltaSink<'_>,
        _cancel: &CancellationToken,
    ) -> Result<ModelTurn, ProviderError> {
        let last_user = request
            .turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.text())
            .unwrap_or_else(|| "(no input)".to_string());
        let text = format!("Echo from Mock: {last_user}");
        on_delta(&text);
        Ok(ModelTurn {
            blocks: vec![ContentBlock::text(text)],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
        })
    }
}

/// 脚本客户端：每次调用弹出一个预设 Turn；脚本耗尽即报错
#[derive(Debug, Default)]
pub struct ScriptedModelClient {
    script: Mutex<VecDeque<ModelTurn>>,
}

impl ScriptedModelClient {
    pub fn new(turns: impl IntoIterator<Item = ModelTurn>) -> Self {
        Self {
            script: Mutex::new(turns.into_iter().collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn stream_turn(
        &self,
        _request: ChatRequest<'_>,
        on_delta: DeltaSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, ProviderError> {
        let turn = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::Parse("script exhausted".to_string()))?;
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled {
                partial: String::new(),
            });
        }
        let text = turn.text();
        if !text.is_empty() {
            on_delta(&text);
        }
        Ok(turn)
    }
}
