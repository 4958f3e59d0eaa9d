//! 各阶段的 prompt 拼装（固定模板，仅做最小拼接）

use schemars::schema_for;

use crate::deliberation::{
    ActionSeed, Candidate, FinalizedActions, FinalizedTasks, Stage, StageRecord, SubjectKind,
};
use crate::llm::Message;

/// trace 中每个阶段输出保留的最大字符数
const TRACE_CHARS: usize = 1500;

/// 一次阶段调用所需的全部输入
pub struct StagePrompt<'a> {
    pub kind: SubjectKind,
    pub stage: Stage,
    pub objective: &'a str,
    pub candidates: &'a [Candidate],
    pub trace: &'a [StageRecord],
    pub memory_context: &'a str,
    pub tools_section: &'a str,
    pub seeds: &'a [ActionSeed],
    pub extra_context: Option<&'a str>,
    pub min_candidates: usize,
    /// 重新考虑的提示（评估阶段检测到的洞察）
    pub hint: Option<&'a str>,
    /// 重试时附带的上次失败原因
    pub retry_note: Option<&'a str>,
}

impl StagePrompt<'_> {
    pub fn to_messages(&self, system: &str) -> Vec<Message> {
        vec![Message::system(system), Message::user(self.render())]
    }

    fn render(&self) -> String {
        let mut s = String::new();
        s.push_str(&format!(
            "# Deliberation: {} stage ({}) for {}\n\n",
            self.stage,
            self.stage.purpose(),
            self.kind.plural()
        ));
        s.push_str(&format!("## Objective\n{}\n\n", self.objective.trim()));
        if let Some(extra) = self.extra_context.filter(|e| !e.trim().is_empty()) {
            s.push_str(&format!("## External context\n{}\n\n", extra.trim()));
        }
        s.push_str(&format!("## Relevant memory\n{}\n\n", self.memory_context));
        s.push_str(&format!("## Available tools\n{}\n\n", self.tools_section));
        if self.kind == SubjectKind::Action && !self.seeds.is_empty() {
            s.push_str("## Suggested actions\n");
            for seed in self.seeds {
                s.push_str(&format!("- {}.{}\n", seed.action_type, seed.action_name));
            }
            s.push('\n');
        }
        if !self.trace.is_empty() {
            s.push_str("## Deliberation so far\n");
            for record in self.trace {
                s.push_str(&format!("### {}\n{}\n", record.stage, truncate(&record.output)));
            }
            s.push('\n');
        }
        if !self.candidates.is_empty() {
            let list = serde_json::to_string_pretty(self.candidates).unwrap_or_else(|_| "[]".into());
            s.push_str(&format!("## Current candidates\n{list}\n\n"));
        }
        s.push_str("## Instructions\n");
        s.push_str(&self.instructions());
        if let Some(note) = self.retry_note {
            s.push_str(&format!(
                "\n\nYour previous reply was rejected: {note}. Reply again following the format exactly."
            ));
        }
        s
    }

    fn candidate_fields(&self) -> &'static str {
        match self.kind {
            SubjectKind::Task => {
                r#"{"name", "description", "steps": [..], "tools": [..], "priority": number, "requires_approval": bool}"#
            }
            SubjectKind::Action => {
                r#"{"action_type": tool name, "name": action name, "description", "parameters": {..}}"#
            }
        }
    }

    fn instructions(&self) -> String {
        let plural = self.kind.plural();
        match self.stage {
            Stage::Generate => format!(
                "Brainstorm at least {} distinct candidate {plural} that serve the objective. \
                 Reply with JSON only: {{\"candidates\": [{}]}}",
                self.min_candidates,
                self.candidate_fields()
            ),
            Stage::Evaluate => format!(
                "Critically assess every current candidate for feasibility, alignment with the objective and risk, \
                 each scored 0.0 to 1.0. Do not add or remove candidates. Reply with JSON only: \
                 {{\"assessments\": [{{\"name\", \"feasibility\", \"alignment\", \"risk\", \"note\"}}]}}"
            ),
            Stage::Reconsider => {
                let mut text = format!(
                    "Reconsider the candidate {plural}: propose alternatives, merge overlapping ones and leave out weak ones. \
                     Reply with the complete new set as JSON only: {{\"candidates\": [{}]}}",
                    self.candidate_fields()
                );
                if let Some(hint) = self.hint {
                    text.push_str(&format!("\nInsight from evaluation: {hint}"));
                }
                text
            }
            Stage::Refine => format!(
                "Tighten each candidate into an actionable description bound to the available tools. \
                 Use only tools listed above. Reply with JSON only: {{\"candidates\": [{}]}}",
                self.candidate_fields()
            ),
            Stage::Finalize => {
                let schema = match self.kind {
                    SubjectKind::Task => serde_json::to_string_pretty(&schema_for!(FinalizedTasks)),
                    SubjectKind::Action => serde_json::to_string_pretty(&schema_for!(FinalizedActions)),
                }
                .unwrap_or_default();
                format!(
                    "Produce exactly one concrete {} per current candidate ({} in total), in the same order. \
                     Reply with JSON only, matching this schema:\n{schema}",
                    self.kind,
                    self.candidates.len()
                )
            }
            Stage::Done => String::new(),
        }
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= TRACE_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(TRACE_CHARS).collect();
    format!("{cut}…")
}
