//! 对话全链路集成测试

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use hive::core::{ConversationOrchestrator, OrchestratorConfig};
    use hive::gateway::{Enqueued, MultiplexerConfig, SessionFactory, SessionMultiplexer};
    use hive::llm::{ModelTurn, ScriptedModelClient, StopReason, TokenUsage};
    use hive::memory::{ContentBlock, Role, SessionStore};
    use hive::tools::{ChannelError, ToolChannel, ToolDescriptor, ToolOutput};

    /// 固定目录、固定应答的工具通道
    struct FixtureChannel {
        catalog: Vec<ToolDescriptor>,
        reply: String,
    }

    impl FixtureChannel {
        fn listing(reply: &str) -> Self {
            Self {
                catalog: vec![ToolDescriptor::new(
                    "list_x",
                    "List all X items",
                    json!({"type": "object", "properties": {}}),
                )],
                reply: reply.to_string(),
            }
        }
    }

    #[async_trait]
    impl ToolChannel for FixtureChannel {
        fn catalog(&self) -> &[ToolDescriptor] {
            &self.catalog
        }

        async fn call(&self, _name: &str, _args: Value) -> Result<ToolOutput, ChannelError> {
            Ok(ToolOutput::text(self.reply.clone()))
        }

        async fn disconnect(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn scripted_listing_client() -> ScriptedModelClient {
        ScriptedModelClient::new(vec![
            ModelTurn {
                blocks: vec![ContentBlock::tool_use("tu_1", "list_x", json!({}))],
                stop_reason: StopReason::ToolUse,
                usage: TokenUsage::default(),
            },
            ModelTurn {
                blocks: vec![ContentBlock::text("No items found.")],
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage::default(),
            },
        ])
    }

    #[tokio::test]
    async fn test_list_scenario_end_to_end() {
        let mut orchestrator = ConversationOrchestrator::new(
            Arc::new(scripted_listing_client()),
            Arc::new(FixtureChannel::listing("[]")),
            50,
            OrchestratorConfig::default(),
        );

        let reply = orchestrator
            .chat("list X", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply, "No items found.");

        let history = orchestrator.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].text(), "list X");
        assert!(history[1].has_tool_use());
        assert_eq!(
            history[2].blocks[0],
            ContentBlock::tool_result("tu_1", "[]", false)
        );
        assert_eq!(history[3].text(), "No items found.");
    }

    #[tokio::test]
    async fn test_history_survives_restart_via_store() {
        let tmp = tempfile::tempdir().unwrap();

        {
            let store = SessionStore::open(tmp.path(), "alice").unwrap();
            let mut orchestrator = ConversationOrchestrator::new(
                Arc::new(scripted_listing_client()),
                Arc::new(FixtureChannel::listing("[]")),
                50,
                OrchestratorConfig::default(),
            )
            .with_store(store);
            orchestrator
                .chat("list X", CancellationToken::new())
                .await
                .unwrap();
        }

        // 重启：新的编排器从同一磁盘会话加载规范化历史
        let store = SessionStore::open(tmp.path(), "alice").unwrap();
        let orchestrator = ConversationOrchestrator::new(
            Arc::new(ScriptedModelClient::new(vec![])),
            Arc::new(FixtureChannel::listing("[]")),
            50,
            OrchestratorConfig::default(),
        )
        .with_store(store);

        let history = orchestrator.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[3].text(), "No items found.");
    }

    struct ListingFactory;

    #[async_trait]
    impl SessionFactory for ListingFactory {
        async fn create(
            &self,
            _identity: &str,
        ) -> Result<ConversationOrchestrator, hive::core::AgentError> {
            Ok(ConversationOrchestrator::new(
                Arc::new(scripted_listing_client()),
                Arc::new(FixtureChannel::listing("[]")),
                50,
                OrchestratorConfig::default(),
            ))
        }
    }

    #[tokio::test]
    async fn test_multiplexed_identities_get_independent_sessions() {
        let mux = Arc::new(SessionMultiplexer::new(
            MultiplexerConfig::default(),
            Arc::new(ListingFactory),
        ));

        let mut receivers = Vec::new();
        for identity in ["tg:1001", "tg:1002"] {
            match mux.enqueue(identity, "list X").await.unwrap() {
                Enqueued::Accepted(rx) => receivers.push(rx),
                Enqueued::Dropped { .. } => panic!("unexpected drop"),
            }
        }
        for rx in receivers {
            assert_eq!(rx.await.unwrap().unwrap(), "No items found.");
        }
        assert_eq!(mux.active_count().await, 2);
    }
}
