//! 工具目录
//!
//! 智能体不在进程内执行工具，只持有外部执行方可接受的 (tool, action) 描述。
//! ToolCatalog 按 tool 名注册，供任务校验（tools 必须已注册）、审议 Refine 阶段的工具过滤、
//! 以及 prompt 中的 Available tools 段落使用。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 单个可用动作的描述：tool 即动作类型，action 为动作名
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub tool: String,
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires_approval: bool,
    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    #[serde(default = "empty_schema")]
    pub parameters: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDescriptor {
    pub fn new(tool: impl Into<String>, action: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            action: action.into(),
            description: description.into(),
            requires_approval: false,
            parameters: empty_schema(),
        }
    }

    pub fn with_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }
}

/// 工具目录：tool 名 -> 该工具下的动作列表（BTreeMap 保证 prompt 输出稳定）
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, Vec<ToolDescriptor>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        let actions = self.tools.entry(descriptor.tool.clone()).or_default();
        match actions.iter_mut().find(|d| d.action == descriptor.action) {
            Some(existing) => *existing = descriptor,
            None => actions.push(descriptor),
        }
    }

    pub fn with(mut self, descriptor: ToolDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn contains_tool(&self, tool: &str) -> bool {
        self.tools.contains_key(tool)
    }

    /// 全部工具都已注册
    pub fn covers<S: AsRef<str>>(&self, tools: &[S]) -> bool {
        tools.iter().all(|t| self.contains_tool(t.as_ref()))
    }

    pub fn find_action(&self, tool: &str, action: &str) -> Option<&ToolDescriptor> {
        self.tools.get(tool)?.iter().find(|d| d.action == action)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values().flatten()
    }

    /// 生成 prompt 中的 Available tools 段落
    pub fn prompt_section(&self) -> String {
        if self.is_empty() {
            return "(no tools available)".to_string();
        }
        self.descriptors()
            .map(|d| {
                let gate = if d.requires_approval { " [requires approval]" } else { "" };
                format!(
                    "- {}.{}: {}{} params={}",
                    d.tool, d.action, d.description, gate, d.parameters
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let catalog = ToolCatalog::new()
            .with(ToolDescriptor::new("twitter", "post_tweet", "Post a tweet"))
            .with(ToolDescriptor::new("wallet", "send_token", "Send tokens").with_approval(true));

        assert!(catalog.contains_tool("wallet"));
        assert!(catalog.covers(&["twitter", "wallet"]));
        assert!(!catalog.covers(&["twitter", "discord"]));
        assert!(catalog.find_action("wallet", "send_token").unwrap().requires_approval);
        assert!(catalog.find_action("wallet", "burn").is_none());
        assert_eq!(catalog.tool_names(), vec!["twitter", "wallet"]);
    }

    #[test]
    fn test_reregister_replaces_action() {
        let mut catalog = ToolCatalog::new();
        catalog.register(ToolDescriptor::new("twitter", "post_tweet", "old"));
        catalog.register(ToolDescriptor::new("twitter", "post_tweet", "new"));
        assert_eq!(catalog.descriptors().count(), 1);
        assert!(catalog.prompt_section().contains("twitter.post_tweet: new"));
    }
}
