//! 带重试的工具调用
//!
//! 只对传输类失败（连接断开、IO、调用超时）做有限次指数退避重试；工具已执行并
//! 报告 is_error 的应用级失败绝不重试（副作用可能非幂等）。重试耗尽后原样抛出
//! 最后一次错误。

use std::time::Duration;

use serde_json::Value;

use crate::tools::catalog::ToolOutput;
use crate::tools::channel::{ChannelError, ToolChannel};

/// 默认额外尝试次数
const DEFAULT_MAX_RETRIES: u32 = 2;
/// 默认退避基数
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// 单次工具调用的重试包装；退避 = base * 2^attempt
#[derive(Clone, Debug)]
pub struct RetryingInvoker {
    max_retries: u32,
    base_delay: Duration,
}

impl Default for RetryingInvoker {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryingInvoker {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// 调用一次工具；传输类错误最多再试 max_retries 次。
    /// Ok 携带 is_error 时直接返回（应用级失败不属于重试范围）。
    pub async fn invoke(
        &self,
        channel: &dyn ToolChannel,
        name: &str,
        args: &Value,
    ) -> Result<ToolOutput, ChannelError> {
        let mut attempt: u32 = 0;
        loop {
            match channel.call(name, args.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_transport() && attempt < self.max_retries => {
                    let delay = self.base_delay * 2u32.saturating_pow(attempt);
                    tracing::warn!(
                        tool = name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transport error, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
