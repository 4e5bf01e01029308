//! Anthropic Messages API 客户端
//!
//! 一次流式请求：对话 Turn 直接按 content block 形状序列化进 messages，工具目录
//! 转为 tools 数组。SSE 事件在边界处累积为有序内容块（text / tool_use），并解析
//! stop_reason 与用量。取消令牌触发时立即停读，携带已流出的部分文本上抛。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::sse::{parse_sse_stream, SseError, SseEvent};
use crate::llm::traits::{
    ChatRequest, DeltaSink, ModelClient, ModelTurn, ProviderError, StopReason, TokenUsage,
};
use crate::memory::ContentBlock;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// 提供方配置：构造后不可变
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: ANTHROPIC_BASE_URL.to_string(),
            api_key: String::new(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// 累计 token 用量（原子计数）
#[derive(Debug, Clone, Default)]
pub struct UsageCounters {
    pub input_tokens: Arc<AtomicU64>,
    pub output_tokens: Arc<AtomicU64>,
}

impl UsageCounters {
    pub fn add(&self, input: u64, output: u64) {
        self.input_tokens.fetch_add(input, Ordering::Relaxed);
        self.output_tokens.fetch_add(output, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        let input = self.input_tokens.load(Ordering::Relaxed);
        let output = self.output_tokens.load(Ordering::Relaxed);
        (input, output, input + output)
    }
}

/// Messages API 客户端：持有 reqwest Client 与模型名
pub struct AnthropicClient {
    config: ProviderConfig,
    http: reqwest::Client,
    pub usage: UsageCounters,
}

/// 正在累积的内容块
enum PendingBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
}

impl AnthropicClient {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self {
            config,
            http,
            usage: UsageCounters::default(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    fn build_request_body(&self, request: &ChatRequest<'_>) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": request.turns,
            "stream": true,
        });

        if !request.system.is_empty() {
            body["system"] = serde_json::json!(request.system);
        }

        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }

        body
    }
}

fn finalize(pending: PendingBlock) -> ContentBlock {
    match pending {
        PendingBlock::Text(text) => ContentBlock::Text { text },
        PendingBlock::ToolUse { id, name, json } => {
            let input = if json.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&json).unwrap_or(serde_json::Value::Null)
            };
            ContentBlock::ToolUse { id, name, input }
        }
    }
}

fn partial_text(blocks: &[ContentBlock], pending: &Option<PendingBlock>) -> String {
    let mut out = String::new();
    for block in blocks {
        if let ContentBlock::Text { text } = block {
            out.push_str(text);
        }
    }
    if let Some(PendingBlock::Text(text)) = pending {
        out.push_str(text);
    }
    out
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn stream_turn(
        &self,
        request: ChatRequest<'_>,
        on_delta: DeltaSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, ProviderError> {
        let body = self.build_request_body(&request);

        tracing::debug!(model = %self.config.model, turns = request.turns.len(), "messages request");

        let response = self
            .http
            .post(self.messages_url())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text: String = text.chars().take(300).collect();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let mut blocks: Vec<ContentBlock> = Vec::new();
        let mut pending: Option<PendingBlock> = None;
        let mut stop_reason: Option<StopReason> = None;
        let mut usage = TokenUsage::default();
        let mut api_error: Option<String> = None;

        let parse_result = parse_sse_stream(response, cancel, |event: SseEvent| {
            let event_type = event.event.as_deref().unwrap_or("");
            let data: serde_json::Value = match serde_json::from_str(&event.data) {
                Ok(v) => v,
                Err(_) => return,
            };

            match event_type {
                "message_start" => {
                    if let Some(u) = data["message"].get("usage") {
                        usage.input_tokens = u["input_tokens"].as_u64().unwrap_or(0);
                    }
                }
                "content_block_start" => {
                    let block = &data["content_block"];
                    match block["type"].as_str().unwrap_or("") {
                        "tool_use" => {
                            pending = Some(PendingBlock::ToolUse {
                                id: block["id"].as_str().unwrap_or("").to_string(),
                                name: block["name"].as_str().unwrap_or("").to_string(),
                                json: String::new(),
                            });
                        }
                        _ => {
                            pending = Some(PendingBlock::Text(
                                block["text"].as_str().unwrap_or("").to_string(),
                            ));
                        }
                    }
                }
                "content_block_delta" => match data["delta"]["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(t) = data["delta"]["text"].as_str() {
                            if let Some(PendingBlock::Text(acc)) = pending.as_mut() {
                                acc.push_str(t);
                            } else if pending.is_none() {
                                pending = Some(PendingBlock::Text(t.to_string()));
                            }
                            on_delta(t);
                        }
                    }
                    "input_json_delta" => {
                        if let Some(part) = data["delta"]["partial_json"].as_str() {
                            if let Some(PendingBlock::ToolUse { json, .. }) = pending.as_mut() {
                                json.push_str(part);
                            }
                        }
                    }
                    _ => {}
                },
                "content_block_stop" => {
                    if let Some(done) = pending.take() {
                        blocks.push(finalize(done));
                    }
                }
                "message_delta" => {
                    if let Some(tag) = data["delta"]["stop_reason"].as_str() {
                        stop_reason = Some(StopReason::parse(tag));
                    }
                    if let Some(u) = data.get("usage") {
                        usage.output_tokens = u["output_tokens"].as_u64().unwrap_or(0);
                    }
                }
                "error" => {
                    api_error = Some(
                        data["error"]["message"]
                            .as_str()
                            .unwrap_or("unknown stream error")
                            .to_string(),
                    );
                }
                _ => {}
            }
        })
        .await;

        match parse_result {
            Ok(()) => {}
            Err(SseError::Cancelled) => {
                return Err(ProviderError::Cancelled {
                    partial: partial_text(&blocks, &pending),
                });
            }
            Err(SseError::Io(e)) => return Err(ProviderError::Network(e)),
        }

        if let Some(message) = api_error {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        // 流异常提前收尾时，未关闭的块仍然收下
        if let Some(done) = pending.take() {
            blocks.push(finalize(done));
        }

        self.usage.add(usage.input_tokens, usage.output_tokens);

        Ok(ModelTurn {
            blocks,
            stop_reason: stop_reason.unwrap_or(StopReason::EndTurn),
            usage,
        })
    }
}
