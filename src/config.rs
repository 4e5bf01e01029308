//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，
//! 如 `HIVE__LLM__MODEL=...`）。加载结果是一次构造、处处传入的不可变值：
//! 改开关意味着用新配置重建通道 / 客户端，而不是运行时改全局状态。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::tools::ChannelConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub channel: ChannelSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub gateway: GatewaySection,
}

/// [app] 段：会话根目录、历史上限、循环安全阀
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话持久化根目录
    pub data_root: PathBuf,
    /// 单会话保留的最大 Turn 数
    pub max_history_turns: usize,
    /// 单次 chat 内「流式 + 工具调度」循环的最大迭代数（防失控模型）
    pub max_loop_iterations: usize,
    /// 工具参数序列化体积硬上限（字节）
    pub max_arg_bytes: usize,
    /// system prompt（为空时用内置默认）
    pub system_prompt: Option<String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_root: PathBuf::from("sessions"),
            max_history_turns: 40,
            max_loop_iterations: 12,
            max_arg_bytes: crate::tools::DEFAULT_MAX_ARG_BYTES,
            system_prompt: None,
        }
    }
}

/// [llm] 段：模型、端点与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: crate::llm::ANTHROPIC_BASE_URL.to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub connect: u64,
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            connect: 10,
            request: 120,
        }
    }
}

/// [channel] 段：工具子进程命令、超时与一次性环境开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    pub command: String,
    pub args: Vec<String>,
    pub allow_writes: bool,
    pub redact: bool,
    pub connect_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub disconnect_timeout_secs: u64,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            command: "hive-tools".to_string(),
            args: Vec::new(),
            allow_writes: false,
            redact: true,
            connect_timeout_secs: 15,
            call_timeout_secs: 60,
            disconnect_timeout_secs: 5,
        }
    }
}

impl ChannelSection {
    /// 转为通道层配置值
    pub fn to_channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            command: self.command.clone(),
            args: self.args.clone(),
            allow_writes: self.allow_writes,
            redact: self.redact,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            disconnect_timeout: Duration::from_secs(self.disconnect_timeout_secs),
        }
    }
}

/// [retry] 段：传输类失败的重试预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
        }
    }
}

/// [gateway] 段：多租户容量与回收
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// 同时存活的会话句柄上限
    pub capacity: usize,
    /// 每个身份的待处理消息队列上限
    pub queue_bound: usize,
    /// 空闲回收阈值（秒）
    pub idle_ttl_secs: u64,
    /// 后台清扫间隔（秒）
    pub sweep_interval_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            capacity: 256,
            queue_bound: 8,
            idle_ttl_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            channel: ChannelSection::default(),
            retry: RetrySection::default(),
            gateway: GatewaySection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_loop_iterations, 12);
        assert_eq!(cfg.retry.max_retries, 2);
        assert!(cfg.gateway.capacity > 0);
        assert!(!cfg.channel.allow_writes);
    }

    #[test]
    fn test_channel_section_conversion() {
        let section = ChannelSection {
            command: "srv".into(),
            connect_timeout_secs: 3,
            ..ChannelSection::default()
        };
        let cfg = section.to_channel_config();
        assert_eq!(cfg.command, "srv");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(3));
        assert!(cfg.redact);
    }
}
