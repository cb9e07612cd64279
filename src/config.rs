//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONDUCTOR__*` 覆盖（双下划线表示嵌套，如 `CONDUCTOR__INTERRUPTS__WORKERS=8`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub interrupts: InterruptsSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub events: EventsSection,
}

/// [engine] 段：节点并发与重试等待
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// 同时处理的引擎命令上限
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,
    /// Retry 顾问未配置等待时间时使用
    #[serde(default)]
    pub default_retry_wait_ms: u64,
    /// 内置委托执行器的并发
    #[serde(default = "default_delegate_workers")]
    pub delegate_workers: usize,
    /// 关闭时每个收尾步骤的时限（秒），也是等待运行中计划结束的时长
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: default_max_concurrent_nodes(),
            default_retry_wait_ms: 0,
            delegate_workers: default_delegate_workers(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_max_concurrent_nodes() -> usize {
    64
}

fn default_delegate_workers() -> usize {
    4
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

/// [interrupts] 段
#[derive(Debug, Clone, Deserialize)]
pub struct InterruptsSection {
    #[serde(default = "default_interrupt_workers")]
    pub workers: usize,
}

impl Default for InterruptsSection {
    fn default() -> Self {
        Self {
            workers: default_interrupt_workers(),
        }
    }
}

fn default_interrupt_workers() -> usize {
    4
}

/// [timeouts] 段
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 设置后，未声明超时的节点自动获得一个 ABSOLUTE 超时
    #[serde(default)]
    pub default_node_timeout_secs: Option<u64>,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            default_node_timeout_secs: None,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

/// [events] 段
#[derive(Debug, Clone, Deserialize)]
pub struct EventsSection {
    /// 单个事件处理器的超时
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    /// 实时订阅通道容量
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            handler_timeout_secs: default_handler_timeout_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_handler_timeout_secs() -> u64 {
    10
}

fn default_channel_capacity() -> usize {
    1024
}

/// 加载配置：config/default.toml（若存在）→ 指定文件（若提供）→ 环境变量 CONDUCTOR__*
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
        config::Environment::with_prefix("CONDUCTOR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.engine.max_concurrent_nodes, 64);
        assert_eq!(config.engine.shutdown_grace_secs, 5);
        assert_eq!(config.interrupts.workers, 4);
        assert_eq!(config.timeouts.poll_interval_ms, 1000);
        assert!(config.timeouts.default_node_timeout_secs.is_none());
        assert_eq!(config.events.handler_timeout_secs, 10);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[interrupts]\nworkers = 9\n\n[timeouts]\ndefault_node_timeout_secs = 30").unwrap();

        let config = load_config(Some(path)).unwrap();
        assert_eq!(config.interrupts.workers, 9);
        assert_eq!(config.timeouts.default_node_timeout_secs, Some(30));
        assert_eq!(config.events.channel_capacity, 1024);
    }
}
