//! 集成测试共用的配置与 LLM 脚本

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;
use tessera::config::{AppConfig, StakeholderEntry};
use tessera::llm::{LlmClient, MockLlmClient};
use tessera::memory::MemoryEntry;
use tessera::store::{InMemoryStore, Record, RecordKind, RecordStore};
use tessera::tools::ToolDescriptor;
use tessera::{Agent, AgentBuilder};

/// twitter.post_tweet（无需审批）、wallet.send_token（需审批），两名各 1.0 权重的投票人
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.llm.provider = "mock".into();
    config.tools = vec![
        ToolDescriptor::new("twitter", "post_tweet", "Post a tweet"),
        ToolDescriptor::new("wallet", "send_token", "Send tokens to an address").with_approval(true),
    ];
    config.stakeholders = vec![
        StakeholderEntry {
            id: "alice".into(),
            weight: 1.0,
        },
        StakeholderEntry {
            id: "bob".into(),
            weight: 1.0,
        },
    ];
    config
}

pub fn build_agent(config: AppConfig, mock: &Arc<MockLlmClient>, store: &Arc<InMemoryStore>) -> Agent {
    let llm: Arc<dyn LlmClient> = mock.clone();
    AgentBuilder::new(config)
        .with_llm(llm)
        .with_store(Arc::clone(store) as Arc<dyn RecordStore>)
        .build()
        .expect("agent builds")
}

pub fn classification(should_generate_action: bool, seeds: &[(&str, &str)]) -> String {
    let seeds: Vec<_> = seeds
        .iter()
        .map(|(t, a)| json!({"action_type": t, "action_name": a}))
        .collect();
    json!({
        "intent": "request",
        "entity": "product",
        "emotion": "positive",
        "confidence": 0.9,
        "should_reply": true,
        "reply": "On it!",
        "should_generate_action": should_generate_action,
        "action_seeds": seeds,
    })
    .to_string()
}

pub fn task_candidates(names: &[&str], tools: &[&str]) -> String {
    let candidates: Vec<_> = names
        .iter()
        .map(|n| json!({"name": n, "description": format!("{n} for the community"), "steps": ["draft", "publish"], "tools": tools}))
        .collect();
    json!({ "candidates": candidates }).to_string()
}

pub fn assessments(names: &[&str]) -> String {
    let items: Vec<_> = names
        .iter()
        .map(|n| json!({"name": n, "feasibility": 0.9, "alignment": 0.8, "risk": 0.1, "note": "solid"}))
        .collect();
    json!({ "assessments": items }).to_string()
}

pub fn finalized_tasks(names: &[&str], tools: &[&str]) -> String {
    let tasks: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(i, n)| json!({
            "name": n,
            "description": format!("{n} for the community"),
            "execution_steps": ["draft", "publish"],
            "priority": 2.0 - i as f64,
            "tools": tools,
        }))
        .collect();
    json!({ "tasks": tasks }).to_string()
}

fn action_items(tool: &str, action: &str, n: usize) -> Vec<serde_json::Value> {
    (0..n)
        .map(|i| json!({"action_type": tool, "name": action, "parameters": {"text": format!("update #{i}")}}))
        .collect()
}

pub fn action_candidates(tool: &str, action: &str, n: usize) -> String {
    json!({ "candidates": action_items(tool, action, n) }).to_string()
}

pub fn action_assessments(action: &str, n: usize) -> String {
    let names: Vec<&str> = std::iter::repeat(action).take(n).collect();
    assessments(&names)
}

pub fn finalized_actions(tool: &str, action: &str, n: usize) -> String {
    json!({ "actions": action_items(tool, action, n) }).to_string()
}

/// 完整五阶段脚本（动作）
pub fn action_pipeline_script(tool: &str, action: &str, n: usize) -> Vec<String> {
    vec![
        action_candidates(tool, action, n),
        action_assessments(action, n),
        action_candidates(tool, action, n),
        action_candidates(tool, action, n),
        finalized_actions(tool, action, n),
    ]
}

/// 完整五阶段脚本（任务）
pub fn task_pipeline_script(names: &[&str]) -> Vec<String> {
    vec![
        task_candidates(names, &["twitter"]),
        assessments(names),
        task_candidates(names, &["twitter"]),
        task_candidates(names, &["twitter"]),
        finalized_tasks(names, &["twitter"]),
    ]
}

pub async fn memories_of_kind(store: &InMemoryStore, kind: &str) -> Vec<MemoryEntry> {
    store
        .list(RecordKind::Memory)
        .await
        .unwrap()
        .into_iter()
        .filter_map(Record::into_memory)
        .filter(|m| m.kind == kind)
        .collect()
}
