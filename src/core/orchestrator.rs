//! 对话编排器：主控循环
//!
//! 驱动 请求 -> 流式响应 -> 工具调度 -> 回执 -> 再请求 的循环：用户输入先入账本，
//! 流出的 assistant Turn（可能含 tool_use）入账本，每个 tool_use 依次经过
//! 校验 / 前置钩子 / 重试调用，无论成败都折叠成恰好一个 tool_result，再整体以
//! user Turn 入账本。模型不再要求工具时返回最终文本。配有最大迭代安全阀与
//! 取消令牌；用量与工具遥测走旁路事件通道，不影响控制流。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{ChatRequest, ModelClient, ProviderError};
use crate::memory::{ContentBlock, HistoryLedger, Role, SessionStore, Turn};
use crate::tools::{
    validate_args, RetryingInvoker, ToolCallResult, ToolChannel, ToolDescriptor,
};

/// 编排器配置：一次构造，不在运行中变更
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub system_prompt: String,
    /// 单次 chat 内循环上限（防失控模型无限要求工具）
    pub max_loop_iterations: usize,
    /// 工具参数体积上限（字节）
    pub max_arg_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are Hive, a helpful assistant with access to remote tools."
                .to_string(),
            max_loop_iterations: 12,
            max_arg_bytes: crate::tools::DEFAULT_MAX_ARG_BYTES,
        }
    }
}

/// 前置钩子的裁决
#[derive(Clone, Debug)]
pub enum HookDecision {
    /// 放行；可选改写参数
    Allow { rewritten_args: Option<Value> },
    /// 拒绝并说明原因（折叠为 is_error 回执）
    Deny { reason: String },
    /// 不调用工具，直接以给定文本作为回执
    ShortCircuit { text: String },
}

/// 工具调度钩子：before 可放行 / 改写 / 拒绝 / 短路，after 仅观测
#[async_trait]
pub trait DispatchHook: Send + Sync {
    async fn before(&self, _name: &str, _args: &Value) -> HookDecision {
        HookDecision::Allow {
            rewritten_args: None,
        }
    }

    async fn after(&self, _result: &ToolCallResult) {}
}

/// 旁路遥测事件；发送失败被忽略，绝不影响控制流
#[derive(Clone, Debug)]
pub enum AgentEvent {
    /// 模型文本增量
    Delta(String),
    ToolStarted { name: String, args: Value },
    ToolFinished {
        name: String,
        is_error: bool,
        duration_ms: u64,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

fn send_event(tx: &Option<mpsc::UnboundedSender<AgentEvent>>, ev: AgentEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 对话编排器：独占一个账本与一条工具通道
pub struct ConversationOrchestrator {
    client: Arc<dyn ModelClient>,
    channel: Arc<dyn ToolChannel>,
    invoker: RetryingInvoker,
    ledger: HistoryLedger,
    store: Option<SessionStore>,
    config: OrchestratorConfig,
    hook: Option<Arc<dyn DispatchHook>>,
    event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl ConversationOrchestrator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        channel: Arc<dyn ToolChannel>,
        max_history_turns: usize,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            channel,
            invoker: RetryingInvoker::default(),
            ledger: HistoryLedger::new(max_history_turns),
            store: None,
            config,
            hook: None,
            event_tx: None,
        }
    }

    /// 挂接磁盘会话：立即加载既有历史（load 内部做规范化）
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.ledger.load(store.load_turns());
        self.store = Some(store);
        self
    }

    pub fn with_invoker(mut self, invoker: RetryingInvoker) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn DispatchHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn history(&self) -> &[Turn] {
        self.ledger.turns()
    }

    /// 清空账本与磁盘会话（磁盘侧为原子 rename）
    pub fn clear(&mut self) -> Result<(), AgentError> {
        self.ledger.clear();
        if let Some(store) = &self.store {
            store.clear().map_err(|e| AgentError::Store(e.to_string()))?;
        }
        Ok(())
    }

    /// 断开工具通道（幂等）
    pub async fn shutdown(&self) {
        if let Err(e) = self.channel.disconnect().await {
            tracing::warn!("tool channel disconnect failed: {e}");
        }
    }

    fn record(&mut self, turn: Turn) {
        if let Some(store) = &self.store {
            store.append_turn(&turn);
            let text = activity_line(&turn);
            store.append_activity(turn.role, &text);
        }
        self.ledger.append(turn);
    }

    /// 处理一条用户消息，跑完整个流式 + 工具调度循环，返回最终文本。
    /// cancel 只中止模型流；已发出的工具调用会跑完，其结果不再返回给调用方。
    pub async fn chat(
        &mut self,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<String, AgentError> {
        self.record(Turn::user(input));

        for _iteration in 0..self.config.max_loop_iterations {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let client = Arc::clone(&self.client);
            let event_tx = self.event_tx.clone();
            let on_delta = move |delta: &str| {
                send_event(&event_tx, AgentEvent::Delta(delta.to_string()));
            };

            let streamed = {
                let request = ChatRequest {
                    system: &self.config.system_prompt,
                    turns: self.ledger.turns(),
                    tools: self.channel.catalog(),
                };
                client.stream_turn(request, &on_delta, &cancel).await
            };

            let model_turn = match streamed {
                Ok(turn) => turn,
                Err(ProviderError::Cancelled { partial }) => {
                    // 半截输出仍然入账本，随后以取消上抛
                    if !partial.is_empty() {
                        self.record(Turn::assistant(partial));
                    }
                    return Err(AgentError::Cancelled);
                }
                Err(e) => return Err(e.into()),
            };

            send_event(
                &self.event_tx,
                AgentEvent::Usage {
                    input_tokens: model_turn.usage.input_tokens,
                    output_tokens: model_turn.usage.output_tokens,
                },
            );

            let mut blocks = model_turn.blocks.clone();
            if blocks.is_empty() {
                blocks.push(ContentBlock::text(""));
            }
            self.record(Turn {
                role: Role::Assistant,
                blocks,
            });

            if !model_turn.wants_tools() {
                return Ok(model_turn.text());
            }

            let mut results: Vec<ContentBlock> = Vec::new();
            for block in &model_turn.blocks {
                let ContentBlock::ToolUse { id, name, input } = block else {
                    continue;
                };
                if cancel.is_cancelled() {
                    results.push(ContentBlock::tool_result(
                        id.clone(),
                        "cancelled before dispatch",
                        true,
                    ));
                    continue;
                }
                let result = self.dispatch_one(name, input).await;
                results.push(ContentBlock::tool_result(
                    id.clone(),
                    result.content.clone(),
                    result.is_error,
                ));
            }
            self.record(Turn::tool_results(results));

            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
        }

        Err(AgentError::IterationLimit(self.config.max_loop_iterations))
    }

    /// 调度一个 tool_use：校验 -> 前置钩子 -> 重试调用 -> 后置钩子。
    /// 任何失败路径都折叠为 is_error 回执，模型可在同轮自我纠正。
    async fn dispatch_one(&self, name: &str, args: &Value) -> ToolCallResult {
        let start = Instant::now();

        let finish = |args: Value, content: String, is_error: bool, start: Instant| ToolCallResult {
            name: name.to_string(),
            args,
            content,
            is_error,
            elapsed: start.elapsed(),
        };

        let descriptor: Option<&ToolDescriptor> =
            self.channel.catalog().iter().find(|d| d.name == name);
        let Some(descriptor) = descriptor else {
            let result = finish(
                args.clone(),
                format!("unknown tool: {name}"),
                true,
                start,
            );
            self.after_dispatch(&result).await;
            return result;
        };

        if let Err(e) = validate_args(descriptor, args, self.config.max_arg_bytes) {
            let result = finish(args.clone(), e.to_string(), true, start);
            self.after_dispatch(&result).await;
            return result;
        }

        let mut effective_args = args.clone();
        if let Some(hook) = &self.hook {
            match hook.before(name, args).await {
                HookDecision::Allow { rewritten_args } => {
                    if let Some(rewritten) = rewritten_args {
                        effective_args = rewritten;
                    }
                }
                HookDecision::Deny { reason } => {
                    let result = finish(args.clone(), format!("denied: {reason}"), true, start);
                    self.after_dispatch(&result).await;
                    return result;
                }
                HookDecision::ShortCircuit { text } => {
                    let result = finish(args.clone(), text, false, start);
                    self.after_dispatch(&result).await;
                    return result;
                }
            }
        }

        send_event(
            &self.event_tx,
            AgentEvent::ToolStarted {
                name: name.to_string(),
                args: effective_args.clone(),
            },
        );

        let result = match self
            .invoker
            .invoke(self.channel.as_ref(), name, &effective_args)
            .await
        {
            Ok(output) => finish(
                effective_args,
                output.concatenated_text(),
                output.is_error,
                start,
            ),
            Err(e) => finish(effective_args, e.to_string(), true, start),
        };
        self.after_dispatch(&result).await;
        result
    }

    async fn after_dispatch(&self, result: &ToolCallResult) {
        let duration_ms = result.elapsed.as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": result.name,
            "ok": !result.is_error,
            "duration_ms": duration_ms,
            "args_preview": args_preview(&result.args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        send_event(
            &self.event_tx,
            AgentEvent::ToolFinished {
                name: result.name.clone(),
                is_error: result.is_error,
                duration_ms,
            },
        );

        if let Some(hook) = &self.hook {
            hook.after(result).await;
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

/// 活动日志行：文本 Turn 取正文，工具块以标记呈现
fn activity_line(turn: &Turn) -> String {
    let mut parts: Vec<String> = Vec::new();
    for block in &turn.blocks {
        match block {
            ContentBlock::Text { text } if !text.is_empty() => parts.push(text.clone()),
            ContentBlock::Text { .. } => {}
            ContentBlock::ToolUse { name, .. } => parts.push(format!("[tool_use {name}]")),
            ContentBlock::ToolResult {
                tool_use_id,
                is_error,
                ..
            } => parts.push(format!(
                "[tool_result {tool_use_id}{}]",
                if *is_error { " error" } else { "" }
            )),
        }
    }
    parts.join(" ")
}
