//! Agent 构建器：按配置装配存储、记忆、治理、任务管理、审议与分类
//!
//! 所有接入方式（stdin 二进制、集成测试）共享同一套装配逻辑；测试可替换 LLM、存储、数据源与执行器。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{Agent, AgentParts, LoggingExecutor, TaskExecutor};
use crate::character::Character;
use crate::classifier::MessageClassifier;
use crate::config::{load_config, AppConfig};
use crate::core::AgentError;
use crate::datasource::{DataSource, HttpDataSource, NoopDataSource};
use crate::deliberation::DeliberationPipeline;
use crate::llm::{create_embedder_from_config, create_llm_from_config, LlmClient};
use crate::memory::{LongTermMemory, MemoryManager, StoreLongTerm};
use crate::store::{InMemoryStore, RecordStore, SqliteStore};
use crate::tasks::{Governance, TaskManager, TaskStore};
use crate::tools::ToolCatalog;

pub struct AgentBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    store: Option<Arc<dyn RecordStore>>,
    data_source: Option<Arc<dyn DataSource>>,
    executor: Option<Arc<dyn TaskExecutor>>,
    character: Option<Character>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            store: None,
            data_source: None,
            executor: None,
            character: None,
        }
    }

    /// 替换按配置创建的 LLM 客户端
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.data_source = Some(source);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_character(mut self, character: Character) -> Self {
        self.character = Some(character);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build_store(&self) -> Result<Arc<dyn RecordStore>, AgentError> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        match self.config.storage.backend.as_str() {
            "sqlite" => {
                let store = SqliteStore::open(&self.config.storage.path)?;
                tracing::info!(path = %self.config.storage.path.display(), "sqlite store opened");
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(InMemoryStore::new())),
            other => Err(AgentError::ConfigError(format!(
                "unknown storage backend '{other}' (expected memory or sqlite)"
            ))),
        }
    }

    pub fn build_catalog(&self) -> ToolCatalog {
        let mut catalog = ToolCatalog::new();
        for descriptor in &self.config.tools {
            catalog.register(descriptor.clone());
        }
        if catalog.is_empty() {
            tracing::warn!("tool catalog is empty, every action candidate will be dropped");
        }
        catalog
    }

    pub fn build_governance(&self) -> Result<Governance, AgentError> {
        let governance = Governance::new(self.config.tasks.min_stakeholder_approval);
        for s in &self.config.stakeholders {
            governance.register_stakeholder(s.id.clone(), s.weight)?;
        }
        Ok(governance)
    }

    fn build_data_source(&self) -> Arc<dyn DataSource> {
        if let Some(source) = &self.data_source {
            return Arc::clone(source);
        }
        let cfg = &self.config.data_source;
        match cfg.base_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => Arc::new(HttpDataSource::new(
                url,
                cfg.api_key.clone(),
                Duration::from_secs(cfg.timeout_secs),
            )),
            None => Arc::new(NoopDataSource),
        }
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let character = match &self.character {
            Some(c) => c.clone(),
            None => Character::load_or_default(self.config.app.character_path.as_deref())?,
        };
        let system_prompt = character.system_prompt();
        let llm = self
            .llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&self.config.llm));

        let store = self.build_store()?;
        let long_term: Arc<dyn LongTermMemory> = Arc::new(
            StoreLongTerm::new(Arc::clone(&store))
                .with_retry_backoff(Duration::from_millis(self.config.llm.retry_backoff_ms)),
        );
        let mut memory = MemoryManager::new(self.config.memory.working_capacity, long_term)
            .with_snapshot_store(Arc::clone(&store));
        let llm_cfg = &self.config.llm;
        if let Some(embedder) = create_embedder_from_config(
            llm_cfg.base_url.as_deref(),
            llm_cfg.embedding_model.as_deref(),
            llm_cfg.api_key.as_deref(),
        ) {
            memory = memory.with_embedder(embedder);
        }
        let memory = Arc::new(memory);

        let catalog = Arc::new(self.build_catalog());
        let governance = Arc::new(self.build_governance()?);
        let tasks = Arc::new(TaskManager::new(
            TaskStore::new(Arc::clone(&store)),
            governance,
            Arc::clone(&memory),
            Arc::clone(&catalog),
            self.config.tasks.clone(),
        ));

        let mut deliberation = self.config.deliberation.clone();
        deliberation.context_limit = self.config.memory.context_limit;
        let pipeline = Arc::new(DeliberationPipeline::new(
            Arc::clone(&llm),
            Arc::clone(&memory),
            Arc::clone(&tasks),
            deliberation,
            system_prompt.clone(),
        ));
        let classifier = MessageClassifier::new(llm, Arc::clone(&memory), catalog, system_prompt)
            .with_context_limit(self.config.memory.context_limit);

        let executor = self
            .executor
            .clone()
            .unwrap_or_else(|| Arc::new(LoggingExecutor));

        tracing::info!(
            character = %character.name,
            storage = %self.config.storage.backend,
            tools = self.config.tools.len(),
            stakeholders = self.config.stakeholders.len(),
            "agent built"
        );

        Ok(Agent::new(AgentParts {
            character,
            memory,
            tasks,
            pipeline,
            classifier,
            data_source: self.build_data_source(),
            data_token: self.config.data_source.token.clone(),
            suggest: self.config.suggest.clone(),
            executor,
        }))
    }
}

/// 便捷函数：加载配置并创建构建器；配置加载失败时使用默认配置
pub fn create_agent_builder(config_path: Option<PathBuf>) -> AgentBuilder {
    let config = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    AgentBuilder::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StakeholderEntry;
    use crate::tools::ToolDescriptor;

    #[test]
    fn test_unknown_backend_rejected() {
        let mut config = AppConfig::default();
        config.storage.backend = "redis".into();
        assert!(matches!(
            AgentBuilder::new(config).build_store(),
            Err(AgentError::ConfigError(_))
        ));
    }

    #[test]
    fn test_invalid_stakeholder_weight_rejected() {
        let mut config = AppConfig::default();
        config.stakeholders.push(StakeholderEntry {
            id: "alice".into(),
            weight: -1.0,
        });
        assert!(AgentBuilder::new(config).build_governance().is_err());
    }

    #[test]
    fn test_catalog_from_config() {
        let mut config = AppConfig::default();
        config
            .tools
            .push(ToolDescriptor::new("twitter", "post_tweet", "Post a tweet").with_approval(true));
        let catalog = AgentBuilder::new(config).build_catalog();
        assert!(catalog.contains_tool("twitter"));
        assert!(catalog.find_action("twitter", "post_tweet").unwrap().requires_approval);
    }
}
