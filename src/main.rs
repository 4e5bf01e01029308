//! Hive - 多租户对话编排引擎
//!
//! 入口：初始化日志、加载配置、连接工具通道并创建编排器，随后逐行读入用户
//! 消息驱动单个本地会话（Ctrl+C 取消当前生成）。多租户网关经 gateway 模块
//! 嵌入各自的桥进程，此处只提供最小的本地驱动。

use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

use hive::config::load_config;
use hive::core::{AgentError, ConversationOrchestrator, OrchestratorConfig};
use hive::llm::create_model_from_config;
use hive::memory::SessionStore;
use hive::tools::McpChannel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({e}), using defaults");
        hive::config::AppConfig::default()
    });

    let client = create_model_from_config(&cfg);

    // 连接期失败快速终止，不留半连接状态
    let channel = McpChannel::connect(&cfg.channel.to_channel_config())
        .await
        .context("failed to connect tool channel")?;

    let store = SessionStore::open(&cfg.app.data_root, "local")
        .context("failed to open session store")?;

    let orchestrator_config = OrchestratorConfig {
        system_prompt: cfg
            .app
            .system_prompt
            .clone()
            .unwrap_or_else(|| OrchestratorConfig::default().system_prompt),
        max_loop_iterations: cfg.app.max_loop_iterations,
        max_arg_bytes: cfg.app.max_arg_bytes,
    };
    let mut orchestrator = ConversationOrchestrator::new(
        client,
        Arc::new(channel),
        cfg.app.max_history_turns,
        orchestrator_config,
    )
    .with_store(store);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/quit" {
            break;
        }
        if input == "/clear" {
            orchestrator.clear().context("failed to clear session")?;
            println!("(session cleared)");
            continue;
        }

        let cancel = CancellationToken::new();
        let chat = orchestrator.chat(input, cancel.clone());
        tokio::pin!(chat);
        let result = loop {
            tokio::select! {
                result = &mut chat => break result,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("cancelling current generation");
                    cancel.cancel();
                }
            }
        };

        match result {
            Ok(reply) => println!("{reply}"),
            Err(AgentError::Cancelled) => println!("(cancelled)"),
            Err(e) => {
                tracing::error!("chat failed: {e}");
                println!("(error: {e})");
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
