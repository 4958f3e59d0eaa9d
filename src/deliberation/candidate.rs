//! 审议候选项、评估结果与定稿格式

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::deliberation::SubjectKind;
use crate::tasks::{Action, Task};

/// 对候选项的评估
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    #[serde(default)]
    pub feasibility: f64,
    #[serde(default)]
    pub alignment: f64,
    #[serde(default)]
    pub risk: f64,
    #[serde(default)]
    pub note: String,
}

impl Assessment {
    /// 分数限制在 [0, 1]，NaN 视为 0
    pub fn normalized(mut self) -> Self {
        let clamp = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        self.feasibility = clamp(self.feasibility);
        self.alignment = clamp(self.alignment);
        self.risk = clamp(self.risk);
        self
    }

    pub fn is_favorable(&self) -> bool {
        self.feasibility >= 0.5 && self.alignment >= 0.5 && self.risk <= 0.5
    }
}

/// 候选任务 / 动作。动作候选以 action_type 为工具、name 为动作名
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, alias = "steps")]
    pub execution_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub requires_stakeholder_input: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<Assessment>,
}

impl Candidate {
    pub fn task(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            action_type: None,
            tools: Vec::new(),
            execution_steps: Vec::new(),
            priority: None,
            requires_approval: false,
            requires_stakeholder_input: false,
            parameters: Map::new(),
            assessment: None,
        }
    }

    pub fn action(action_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            action_type: Some(action_type.into()),
            ..Self::task(name)
        }
    }

    /// 名称比较键（忽略大小写与首尾空白）
    pub fn name_key(&self) -> String {
        self.name.trim().to_lowercase()
    }

    /// 去重键：任务按名称；动作按 类型 + 名称 + 参数
    pub fn distinct_key(&self, kind: SubjectKind) -> String {
        match kind {
            SubjectKind::Task => self.name_key(),
            SubjectKind::Action => format!(
                "{}|{}|{}",
                self.action_type.as_deref().unwrap_or("").trim().to_lowercase(),
                self.name_key(),
                Value::Object(self.parameters.clone())
            ),
        }
    }

    /// 执行该候选所需的全部工具
    pub fn required_tools(&self) -> BTreeSet<String> {
        let mut tools: BTreeSet<String> = self.tools.iter().map(|t| t.trim().to_string()).collect();
        if let Some(t) = &self.action_type {
            tools.insert(t.trim().to_string());
        }
        tools.retain(|t| !t.is_empty());
        tools
    }
}

/// 去重（保留首次出现），并丢弃空名称
pub fn dedupe_candidates(candidates: Vec<Candidate>, kind: SubjectKind) -> Vec<Candidate> {
    let mut seen = BTreeSet::new();
    candidates
        .into_iter()
        .filter(|c| !c.name.trim().is_empty())
        .filter(|c| seen.insert(c.distinct_key(kind)))
        .collect()
}

/// 分类器给出的动作种子
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSeed {
    #[serde(alias = "type", alias = "tool")]
    pub action_type: String,
    #[serde(alias = "name", alias = "action")]
    pub action_name: String,
}

/// 定稿阶段的任务格式
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct TaskSpec {
    /// 简短的任务名
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 有序执行步骤，至少一步
    pub execution_steps: Vec<String>,
    /// 越大越紧急
    #[serde(default = "default_priority")]
    pub priority: f64,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub requires_stakeholder_input: bool,
    /// 只能使用 Available tools 中列出的工具
    #[serde(default)]
    pub tools: Vec<String>,
    /// 从现在起的截止分钟数
    #[serde(default)]
    pub deadline_minutes: Option<u32>,
}

fn default_priority() -> f64 {
    1.0
}

impl TaskSpec {
    pub fn into_task(self, created_by: &str) -> Task {
        let mut task = Task::new(self.name, self.description)
            .with_steps(self.execution_steps)
            .with_priority(self.priority)
            .with_tools(self.tools)
            .with_approval(self.requires_approval)
            .with_created_by(created_by);
        task.requires_stakeholder_input = self.requires_stakeholder_input;
        if let Some(minutes) = self.deadline_minutes {
            task.deadline = Some(Utc::now() + Duration::minutes(i64::from(minutes)));
        }
        task
    }
}

/// 定稿阶段的动作格式
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ActionSpec {
    /// 动作类型（工具名）
    pub action_type: String,
    /// 该工具下的动作名
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl ActionSpec {
    pub fn into_action(self) -> Action {
        Action {
            action_type: self.action_type,
            name: self.name,
            parameters: self.parameters.into_iter().collect(),
            task_id: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FinalizedTasks {
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FinalizedActions {
    pub actions: Vec<ActionSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dedupe_by_kind() {
        let tasks = vec![
            Candidate::task("Post update"),
            Candidate::task(" post UPDATE "),
            Candidate::task(""),
            Candidate::task("Reply"),
        ];
        assert_eq!(dedupe_candidates(tasks, SubjectKind::Task).len(), 2);

        let mut a = Candidate::action("twitter", "post_tweet");
        a.parameters.insert("text".into(), json!("gm"));
        let mut b = a.clone();
        b.parameters.insert("text".into(), json!("gn"));
        let actions = vec![a.clone(), a, b];
        assert_eq!(dedupe_candidates(actions, SubjectKind::Action).len(), 2);
    }

    #[test]
    fn test_required_tools_include_action_type() {
        let mut c = Candidate::action("wallet", "send_token");
        c.tools = vec!["twitter".into(), " ".into()];
        let tools: Vec<String> = c.required_tools().into_iter().collect();
        assert_eq!(tools, vec!["twitter", "wallet"]);
    }

    #[test]
    fn test_assessment_normalized() {
        let a = Assessment {
            feasibility: 1.4,
            alignment: f64::NAN,
            risk: -1.0,
            note: String::new(),
        }
        .normalized();
        assert_eq!((a.feasibility, a.alignment, a.risk), (1.0, 0.0, 0.0));
        assert!(!a.is_favorable());
    }

    #[test]
    fn test_seed_aliases() {
        let seed: ActionSeed = serde_json::from_value(json!({"type": "twitter", "name": "post_tweet"})).unwrap();
        assert_eq!(seed.action_type, "twitter");
        assert_eq!(seed.action_name, "post_tweet");
    }
}
