//! 工具通道：MCP stdio 子进程
//!
//! connect 一次完成「起子进程 + 握手 + tools/list」，整体受连接超时约束，任一步
//! 失败即完整拆除，不存在半连接状态。写权限 / 脱敏等开关在 connect 时烘焙进子
//! 进程环境，改开关 = 用新配置重建通道。call 单发不重试（重试属于上层 Invoker），
//! disconnect 限时且幂等。

use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParams, ClientCapabilities, InitializeRequestParams, ProtocolVersion,
};
use rmcp::service::{serve_client, RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::tools::catalog::{ToolContent, ToolDescriptor, ToolOutput};

/// 通道错误：显式可枚举的种类，重试判定基于种类而非错误文本
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to spawn tool process: {0}")]
    Spawn(String),

    #[error("tool channel connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("tool call timed out: {0}")]
    CallTimeout(String),

    #[error("tool channel closed")]
    Closed,

    #[error("tool channel io error: {0}")]
    Io(String),

    #[error("tool protocol error: {0}")]
    Protocol(String),

    #[error("tool channel not connected")]
    NotConnected,
}

impl ChannelError {
    /// 传输类错误才可重试；协议 / 未连接 / 连接期错误不重试
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChannelError::Closed | ChannelError::Io(_) | ChannelError::CallTimeout(_)
        )
    }
}

/// 通道配置：启动命令、超时与一次性烘焙进子进程环境的开关。
/// 构造后不可变；变更意味着 disconnect 后用新配置重连。
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub command: String,
    pub args: Vec<String>,
    /// 烘焙为 HIVE_ALLOW_WRITES=0/1
    pub allow_writes: bool,
    /// 烘焙为 HIVE_REDACT=0/1
    pub redact: bool,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub disconnect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command: "hive-tools".to_string(),
            args: Vec::new(),
            allow_writes: false,
            redact: true,
            connect_timeout: Duration::from_secs(15),
            call_timeout: Duration::from_secs(60),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

/// 工具通道抽象：目录在连接时拉取一次，call 按名单发，disconnect 幂等
#[async_trait]
pub trait ToolChannel: Send + Sync {
    /// 连接时解析好的工具目录（连接生命周期内不变）
    fn catalog(&self) -> &[ToolDescriptor];

    /// 发送一次调用并返回一个结果；不在此层重试
    async fn call(&self, name: &str, args: Value) -> Result<ToolOutput, ChannelError>;

    /// 限时拆除传输；重复调用是无害的
    async fn disconnect(&self) -> Result<(), ChannelError>;
}

/// MCP stdio 通道：子进程 + rmcp 握手；调用内部持锁串行（单编排器独占，按序调度）
pub struct McpChannel {
    service: Mutex<Option<RunningService<RoleClient, InitializeRequestParams>>>,
    catalog: Vec<ToolDescriptor>,
    call_timeout: Duration,
    disconnect_timeout: Duration,
}

impl McpChannel {
    /// 建立连接：spawn 子进程（环境开关烘焙于此）、握手、拉取目录。
    /// 任一步失败或超时，子进程随传输一起拆除，返回错误。
    pub async fn connect(cfg: &ChannelConfig) -> Result<Self, ChannelError> {
        let mut cmd = Command::new(&cfg.command);
        cmd.args(&cfg.args)
            .env("HIVE_ALLOW_WRITES", if cfg.allow_writes { "1" } else { "0" })
            .env("HIVE_REDACT", if cfg.redact { "1" } else { "0" })
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped());

        let (transport, _stderr) = TokioChildProcess::builder(cmd)
            .spawn()
            .map_err(|e| ChannelError::Spawn(e.to_string()))?;

        let init = InitializeRequestParams {
            meta: None,
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ClientCapabilities::default(),
            client_info: rmcp::model::Implementation::from_build_env(),
        };

        // 握手超时：超时丢弃传输即杀掉子进程，无部分连接状态
        let service = timeout(cfg.connect_timeout, serve_client(init, transport))
            .await
            .map_err(|_| ChannelError::ConnectTimeout(cfg.connect_timeout))?
            .map_err(|e| ChannelError::Protocol(format!("handshake: {e}")))?;

        let listed = match timeout(cfg.connect_timeout, service.list_tools(None)).await {
            Err(_) => {
                let _ = service.cancel().await;
                return Err(ChannelError::ConnectTimeout(cfg.connect_timeout));
            }
            Ok(Err(e)) => {
                let _ = service.cancel().await;
                return Err(ChannelError::Protocol(format!("tools/list: {e}")));
            }
            Ok(Ok(listed)) => listed,
        };

        let catalog: Vec<ToolDescriptor> = listed
            .tools
            .into_iter()
            .map(|tool| {
                ToolDescriptor::new(
                    tool.name.to_string(),
                    tool.description
                        .as_ref()
                        .map(|d| d.to_string())
                        .unwrap_or_default(),
                    Value::Object((*tool.input_schema).clone()),
                )
            })
            .collect();

        tracing::info!(tools = catalog.len(), command = %cfg.command, "tool channel connected");

        Ok(Self {
            service: Mutex::new(Some(service)),
            catalog,
            call_timeout: cfg.call_timeout,
            disconnect_timeout: cfg.disconnect_timeout,
        })
    }
}

#[async_trait]
impl ToolChannel for McpChannel {
    fn catalog(&self) -> &[ToolDescriptor] {
        &self.catalog
    }

    async fn call(&self, name: &str, args: Value) -> Result<ToolOutput, ChannelError> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or(ChannelError::NotConnected)?;

        let params = CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments: args.as_object().cloned(),
            task: None,
        };

        let result = timeout(self.call_timeout, service.call_tool(params))
            .await
            .map_err(|_| ChannelError::CallTimeout(name.to_string()))?
            .map_err(map_service_error)?;

        // 按 MCP 线上形状解析一次（content 文本部件 / structuredContent / isError）
        let raw = serde_json::to_value(&result)
            .map_err(|e| ChannelError::Protocol(format!("tools/call result: {e}")))?;
        Ok(resolve_call_result(&raw))
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        let service = self.service.lock().await.take();
        let Some(service) = service else {
            return Ok(());
        };
        match timeout(self.disconnect_timeout, service.cancel()).await {
            Err(_) => Err(ChannelError::Io("disconnect timed out".to_string())),
            Ok(Err(e)) => Err(ChannelError::Io(e.to_string())),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

/// 把 tools/call 的线上结果解析为带标签的内容变体；未知部件整体保留为结构化
fn resolve_call_result(raw: &Value) -> ToolOutput {
    let mut content: Vec<ToolContent> = Vec::new();
    if let Some(parts) = raw.get("content").and_then(Value::as_array) {
        for part in parts {
            match part.get("type").and_then(Value::as_str) {
                Some("text") => content.push(ToolContent::Text(
                    part.get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                )),
                _ => content.push(ToolContent::Structured(part.clone())),
            }
        }
    }
    if let Some(structured) = raw.get("structuredContent") {
        if !structured.is_null() {
            content.push(ToolContent::Structured(structured.clone()));
        }
    }
    ToolOutput {
        content,
        is_error: raw
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

fn map_service_error(e: rmcp::service::ServiceError) -> ChannelError {
    use rmcp::service::ServiceError;
    match &e {
        ServiceError::TransportClosed => ChannelError::Closed,
        ServiceError::TransportSend(_) => ChannelError::Io(e.to_string()),
        ServiceError::Timeout { .. } => ChannelError::CallTimeout(e.to_string()),
        _ => ChannelError::Protocol(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_call_result() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "image", "data": "...", "mimeType": "image/png"}
            ],
            "isError": true
        });
        let out = resolve_call_result(&raw);
        assert!(out.is_error);
        assert_eq!(out.content.len(), 2);
        assert_eq!(out.content[0], ToolContent::Text("hello".into()));
        assert!(matches!(out.content[1], ToolContent::Structured(_)));
    }

    #[test]
    fn test_resolve_call_result_structured_and_missing_fields() {
        let raw = json!({"structuredContent": {"items": []}});
        let out = resolve_call_result(&raw);
        assert!(!out.is_error);
        assert_eq!(out.content.len(), 1);
        assert_eq!(out.concatenated_text(), r#"{"items":[]}"#);
    }

    #[test]
    fn test_transport_classification() {
        assert!(ChannelError::Closed.is_transport());
        assert!(ChannelError::Io("reset".into()).is_transport());
        assert!(ChannelError::CallTimeout("t".into()).is_transport());
        assert!(!ChannelError::Protocol("bad".into()).is_transport());
        assert!(!ChannelError::NotConnected.is_transport());
        assert!(!ChannelError::ConnectTimeout(Duration::from_secs(1)).is_transport());
        assert!(!ChannelError::Spawn("no such file".into()).is_transport());
    }
}
