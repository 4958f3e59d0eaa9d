//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TESSERA__*` 覆盖（双下划线表示嵌套，如 `TESSERA__LLM__PROVIDER=mock`）。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::deliberation::DeliberationSettings;
use crate::tasks::TaskSettings;
use crate::tools::ToolDescriptor;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub storage: StorageSection,
    pub memory: MemorySection,
    pub tasks: TaskSettings,
    pub deliberation: DeliberationSettings,
    pub data_source: DataSourceSection,
    pub workers: WorkersSection,
    pub suggest: SuggestSection,
    pub stakeholders: Vec<StakeholderEntry>,
    /// 可用工具目录
    pub tools: Vec<ToolDescriptor>,
}

/// [app] 段：应用名、角色档案路径
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 角色档案（.toml / .json），未设置时使用默认角色
    pub character_path: Option<PathBuf>,
}

/// [llm] 段：后端选择、超时与嵌入模型
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai（任意 OpenAI 兼容服务）/ mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    /// 瞬时错误重试前的退避（毫秒）
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// 设置后启用向量检索
    pub embedding_model: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            timeouts: LlmTimeoutsSection::default(),
            retry_backoff_ms: default_retry_backoff_ms(),
            embedding_model: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [storage] 段：memory（进程内）/ sqlite
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_storage_path(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/tessera.db")
}

/// [memory] 段：工作记忆容量、每次检索的上下文条数
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_working_capacity")]
    pub working_capacity: usize,
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            working_capacity: default_working_capacity(),
            context_limit: default_context_limit(),
        }
    }
}

fn default_working_capacity() -> usize {
    100
}

fn default_context_limit() -> usize {
    10
}

/// [data_source] 段：未设置 base_url 时不启用
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DataSourceSection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// 默认查询的代币
    pub token: Option<String>,
    #[serde(default = "default_data_source_timeout")]
    pub timeout_secs: u64,
}

fn default_data_source_timeout() -> u64 {
    10
}

/// [workers] 段：并发处理的作业数、自主建议间隔
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersSection {
    #[serde(default = "default_worker_size")]
    pub size: usize,
    /// 0 表示不启动定时器
    #[serde(default = "default_suggest_interval")]
    pub suggest_interval_secs: u64,
    /// 调度（激活 / 过期 / 执行回报）间隔
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            size: default_worker_size(),
            suggest_interval_secs: default_suggest_interval(),
            tick_interval_secs: default_tick_interval(),
        }
    }
}

fn default_worker_size() -> usize {
    4
}

fn default_suggest_interval() -> u64 {
    300
}

fn default_tick_interval() -> u64 {
    5
}

/// [suggest] 段：自主建议的目标与指标阈值
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SuggestSection {
    /// 未设置时使用角色目标
    pub objective: Option<String>,
    /// 指标名 -> 阈值；当前值来自数据源
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
}

/// [[stakeholders]]：审批投票人及其权重
#[derive(Debug, Clone, Deserialize)]
pub struct StakeholderEntry {
    pub id: String,
    pub weight: f64,
}

/// 从 config 目录加载配置，环境变量 TESSERA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TESSERA__*（双下划线表示嵌套键）
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
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignored");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TESSERA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
