//! 会话多路复用：按外部身份管理并发会话
//!
//! 每个身份一个 SessionHandle：独占一个编排器 + 有界待处理队列 + processing 互斥
//! 标志。同一身份严格串行（先提交先处理，绝不并发两次 chat），不同身份完全并行。
//! 句柄懒创建，受全局容量约束：满员时先尝试驱逐最久未活跃的空闲句柄，仍满则拒绝。
//! 队列满时丢弃新消息并累加该身份的丢弃计数（调用方据此限流）。后台清扫按空闲
//! TTL 回收句柄，回收前先断开其工具通道。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, ConversationOrchestrator};

/// 多路复用配置
#[derive(Clone, Debug)]
pub struct MultiplexerConfig {
    /// 同时存活的句柄上限
    pub capacity: usize,
    /// 每身份待处理队列上限
    pub queue_bound: usize,
    /// 空闲回收阈值
    pub idle_ttl: Duration,
    /// 后台清扫间隔
    pub sweep_interval: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            queue_bound: 8,
            idle_ttl: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// 会话工厂：为新身份构建编排器（连通道、挂存储等）
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, identity: &str) -> Result<ConversationOrchestrator, AgentError>;
}

/// 入队结果：接受（附回执接收端）或因队列满被丢弃（附累计丢弃数，调用方应限流）
pub enum Enqueued {
    Accepted(oneshot::Receiver<Result<String, AgentError>>),
    Dropped { dropped_total: u64 },
}

struct InboundMessage {
    text: String,
    reply_tx: oneshot::Sender<Result<String, AgentError>>,
}

/// 单身份的在内存会话句柄
pub struct SessionHandle {
    identity: String,
    orchestrator: Mutex<ConversationOrchestrator>,
    queue: std::sync::Mutex<VecDeque<InboundMessage>>,
    /// 同一时刻至多一个排空任务在跑
    processing: AtomicBool,
    last_active: std::sync::Mutex<Instant>,
    dropped: AtomicU64,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("identity", &self.identity)
            .field("pending", &self.pending())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

impl SessionHandle {
    fn new(identity: String, orchestrator: ConversationOrchestrator) -> Self {
        Self {
            identity,
            orchestrator: Mutex::new(orchestrator),
            queue: std::sync::Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            last_active: std::sync::Mutex::new(Instant::now()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().unwrap().elapsed()
    }

    fn is_idle(&self) -> bool {
        !self.processing.load(Ordering::SeqCst) && self.queue.lock().unwrap().is_empty()
    }
}

/// 多租户会话多路复用器
pub struct SessionMultiplexer {
    config: MultiplexerConfig,
    factory: Arc<dyn SessionFactory>,
    handles: Mutex<HashMap<String, Arc<SessionHandle>>>,
    /// 遥测：每次排空处理完成后通知（身份, 结果是否成功）
    drained_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<(String, bool)>>>,
}

impl SessionMultiplexer {
    pub fn new(config: MultiplexerConfig, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            config,
            factory,
            handles: Mutex::new(HashMap::new()),
            drained_tx: std::sync::Mutex::new(None),
        }
    }

    /// 旁路遥测：排空每处理完一条消息发一次
    pub fn set_drained_tx(&self, tx: mpsc::UnboundedSender<(String, bool)>) {
        *self.drained_tx.lock().unwrap() = Some(tx);
    }

    pub async fn active_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// 取得（必要时创建）身份的句柄。容量满时先驱逐最久未活跃的空闲句柄；
    /// 无可驱逐则拒绝创建。
    pub async fn get_or_create(&self, identity: &str) -> Result<Arc<SessionHandle>, AgentError> {
        {
            let handles = self.handles.lock().await;
            if let Some(handle) = handles.get(identity) {
                return Ok(handle.clone());
            }
        }

        // 创建放在锁外，避免工厂 IO 阻塞其他身份
        let orchestrator = self.factory.create(identity).await?;
        let fresh = Arc::new(SessionHandle::new(identity.to_string(), orchestrator));

        let mut handles = self.handles.lock().await;
        if let Some(existing) = handles.get(identity) {
            // 并发创建竞争：保留先到者，新建的断开丢弃
            let winner = existing.clone();
            drop(handles);
            fresh.orchestrator.lock().await.shutdown().await;
            return Ok(winner);
        }

        if handles.len() >= self.config.capacity {
            let victim = handles
                .values()
                .filter(|h| h.is_idle())
                .min_by_key(|h| *h.last_active.lock().unwrap())
                .cloned();
            match victim {
                Some(victim) => {
                    handles.remove(victim.identity());
                    tracing::info!(identity = victim.identity(), "evicting idle session at capacity");
                    victim.orchestrator.lock().await.shutdown().await;
                }
                None => {
                    drop(handles);
                    fresh.orchestrator.lock().await.shutdown().await;
                    return Err(AgentError::AtCapacity);
                }
            }
        }

        handles.insert(identity.to_string(), fresh.clone());
        Ok(fresh)
    }

    /// 投递一条入站消息。队列满则丢弃并累加计数；否则入队并确保排空任务在跑。
    pub async fn enqueue(&self, identity: &str, text: impl Into<String>) -> Result<Enqueued, AgentError> {
        let handle = self.get_or_create(identity).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut queue = handle.queue.lock().unwrap();
            if queue.len() >= self.config.queue_bound {
                let dropped_total = handle.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    identity = handle.identity(),
                    dropped_total,
                    "inbound queue full, dropping message"
                );
                return Ok(Enqueued::Dropped { dropped_total });
            }
            queue.push_back(InboundMessage {
                text: text.into(),
                reply_tx,
            });
        }
        handle.touch();
        self.spawn_drain(handle);
        Ok(Enqueued::Accepted(reply_rx))
    }

    /// 确保该句柄有且仅有一个排空任务：抢到 processing 标志者启动任务串行消费
    fn spawn_drain(&self, handle: Arc<SessionHandle>) {
        if handle
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let drained_tx = self.drained_tx.lock().unwrap().clone();
        tokio::spawn(async move {
            loop {
                let msg = handle.queue.lock().unwrap().pop_front();
                match msg {
                    Some(msg) => {
                        let cancel = CancellationToken::new();
                        let result = {
                            let mut orchestrator = handle.orchestrator.lock().await;
                            orchestrator.chat(&msg.text, cancel).await
                        };
                        handle.touch();
                        if let Some(tx) = &drained_tx {
                            let _ = tx.send((handle.identity.clone(), result.is_ok()));
                        }
                        let _ = msg.reply_tx.send(result);
                    }
                    None => {
                        handle.processing.store(false, Ordering::SeqCst);
                        // 收尾竞争：清标志后又有消息入队且没人接手，则自己接着干
                        let refill = !handle.queue.lock().unwrap().is_empty();
                        if refill
                            && handle
                                .processing
                                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                                .is_ok()
                        {
                            continue;
                        }
                        break;
                    }
                }
            }
        });
    }

    /// 回收空闲超过 TTL 的句柄（先断开工具通道），返回回收个数
    pub async fn sweep_idle(&self) -> usize {
        let expired: Vec<Arc<SessionHandle>> = {
            let mut handles = self.handles.lock().await;
            let victims: Vec<String> = handles
                .values()
                .filter(|h| h.is_idle() && h.idle_for() >= self.config.idle_ttl)
                .map(|h| h.identity.clone())
                .collect();
            victims
                .iter()
                .filter_map(|id| handles.remove(id))
                .collect()
        };
        for handle in &expired {
            tracing::info!(identity = handle.identity(), "evicting idle session past TTL");
            handle.orchestrator.lock().await.shutdown().await;
        }
        expired.len()
    }

    /// 启动后台清扫循环
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(mux.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = mux.sweep_idle().await;
                if removed > 0 {
                    tracing::debug!(removed, "idle session sweep");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    use crate::core::OrchestratorConfig;
    use crate::llm::{ChatRequest, DeltaSink, ModelClient, ModelTurn, ProviderError, StopReason, TokenUsage};
    use crate::memory::ContentBlock;
    use crate::tools::{ChannelError, ToolChannel, ToolDescriptor, ToolOutput};

    /// 空通道：无目录，永不被调用
    struct EmptyChannel;

    #[async_trait]
    impl ToolChannel for EmptyChannel {
        fn catalog(&self) -> &[ToolDescriptor] {
            &[]
        }
        async fn call(&self, _: &str, _: Value) -> Result<ToolOutput, ChannelError> {
            Ok(ToolOutput::text(""))
        }
        async fn disconnect(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    /// 检测并发重入并记录处理顺序的模型客户端
    struct GuardedClient {
        in_flight: Arc<AtomicBool>,
        order: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl ModelClient for GuardedClient {
        async fn stream_turn(
            &self,
            request: ChatRequest<'_>,
            _on_delta: DeltaSink<'_>,
            _cancel: &CancellationToken,
        ) -> Result<ModelTurn, ProviderError> {
            assert!(
                !self.in_flight.swap(true, Ordering::SeqCst),
                "two orchestrator calls in flight for one identity"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
            let input = request.turns.last().unwrap().text();
            self.order.lock().unwrap().push(input.clone());
            self.in_flight.store(false, Ordering::SeqCst);
            Ok(ModelTurn {
                blocks: vec![ContentBlock::text(format!("re: {input}"))],
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage::default(),
            })
        }
    }

    struct TestFactory {
        order: Arc<StdMutex<Vec<String>>>,
        created: AtomicU32,
    }

    impl TestFactory {
        fn new() -> Self {
            Self {
                order: Arc::new(StdMutex::new(Vec::new())),
                created: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionFactory for TestFactory {
        async fn create(&self, _identity: &str) -> Result<ConversationOrchestrator, AgentError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            // 每个句柄独立的重入护栏（同身份互斥是每句柄性质）
            let client = GuardedClient {
                in_flight: Arc::new(AtomicBool::new(false)),
                order: Arc::clone(&self.order),
            };
            Ok(ConversationOrchestrator::new(
                Arc::new(client),
                Arc::new(EmptyChannel),
                50,
                OrchestratorConfig::default(),
            ))
        }
    }

    fn mux(capacity: usize, queue_bound: usize, idle_ttl: Duration) -> Arc<SessionMultiplexer> {
        Arc::new(SessionMultiplexer::new(
            MultiplexerConfig {
                capacity,
                queue_bound,
                idle_ttl,
                sweep_interval: Duration::from_millis(50),
            },
            Arc::new(TestFactory::new()),
        ))
    }

    #[tokio::test]
    async fn test_same_identity_processed_in_order() {
        let factory = Arc::new(TestFactory::new());
        let order = Arc::clone(&factory.order);
        let mux = Arc::new(SessionMultiplexer::new(
            MultiplexerConfig::default(),
            factory,
        ));

        let a = match mux.enqueue("alice", "first").await.unwrap() {
            Enqueued::Accepted(rx) => rx,
            _ => panic!("dropped"),
        };
        let b = match mux.enqueue("alice", "second").await.unwrap() {
            Enqueued::Accepted(rx) => rx,
            _ => panic!("dropped"),
        };

        assert_eq!(a.await.unwrap().unwrap(), "re: first");
        assert_eq!(b.await.unwrap().unwrap(), "re: second");
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_identities_run_in_parallel() {
        let mux = mux(16, 8, Duration::from_secs(3600));
        let mut receivers = Vec::new();
        for identity in ["a", "b", "c", "d"] {
            match mux.enqueue(identity, format!("hi from {identity}")).await.unwrap() {
                Enqueued::Accepted(rx) => receivers.push(rx),
                _ => panic!("dropped"),
            }
        }
        for rx in receivers {
            assert!(rx.await.unwrap().is_ok());
        }
        assert_eq!(mux.active_count().await, 4);
    }

    #[tokio::test]
    async fn test_queue_bound_drops_and_counts() {
        let mux = mux(16, 1, Duration::from_secs(3600));
        // 句柄先建好但不启动排空：直接往队列塞以测上界
        let handle = mux.get_or_create("bob").await.unwrap();
        {
            let mut q = handle.queue.lock().unwrap();
            let (tx, _rx) = oneshot::channel();
            q.push_back(InboundMessage {
                text: "waiting".into(),
                reply_tx: tx,
            });
        }

        match mux.enqueue("bob", "overflow").await.unwrap() {
            Enqueued::Dropped { dropped_total } => assert_eq!(dropped_total, 1),
            _ => panic!("expected drop"),
        }
        match mux.enqueue("bob", "overflow again").await.unwrap() {
            Enqueued::Dropped { dropped_total } => assert_eq!(dropped_total, 2),
            _ => panic!("expected drop"),
        }
        assert_eq!(handle.dropped_count(), 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_idle_then_refuses() {
        let mux = mux(2, 8, Duration::from_secs(3600));
        let first = mux.get_or_create("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _second = mux.get_or_create("b").await.unwrap();

        // 第三个身份：a 最久未活跃且空闲，被驱逐
        let _third = mux.get_or_create("c").await.unwrap();
        assert_eq!(mux.active_count().await, 2);
        assert!(first.is_idle());
        let handles = mux.handles.lock().await;
        assert!(!handles.contains_key("a"));
        assert!(handles.contains_key("b") && handles.contains_key("c"));
        drop(handles);

        // 全部句柄都「忙」时拒绝新建
        for handle in mux.handles.lock().await.values() {
            handle.processing.store(true, Ordering::SeqCst);
        }
        let err = mux.get_or_create("d").await.unwrap_err();
        assert!(matches!(err, AgentError::AtCapacity));
        for handle in mux.handles.lock().await.values() {
            handle.processing.store(false, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_past_ttl() {
        let mux = mux(16, 8, Duration::from_millis(1));
        mux.get_or_create("old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = mux.sweep_idle().await;
        assert_eq!(removed, 1);
        assert_eq!(mux.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_existing_handle_reused() {
        let factory = Arc::new(TestFactory::new());
        let mux = Arc::new(SessionMultiplexer::new(
            MultiplexerConfig::default(),
            factory.clone(),
        ));
        let h1 = mux.get_or_create("alice").await.unwrap();
        let h2 = mux.get_or_create("alice").await.unwrap();
        assert!(Arc::ptr_eq(&h1, &h2));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }
}
