//! 模型输出解析：<think> 推理块、JSON 提取、候选 / 评估 / 定稿结构、重新考虑措辞检测

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::deliberation::{Assessment, Candidate};

static THINK_RE: OnceLock<Regex> = OnceLock::new();
static RECONSIDER_RE: OnceLock<Regex> = OnceLock::new();

fn think_re() -> &'static Regex {
    THINK_RE.get_or_init(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("think regex"))
}

fn reconsider_re() -> &'static Regex {
    RECONSIDER_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(wait|hold on|actually|better approach|simpler solution|just realized|alternatively|more efficient|we could instead)\b",
        )
        .expect("reconsider regex")
    })
}

/// 拆出 <think>…</think> 中的推理，返回（去掉推理后的正文, 推理）
pub fn split_reasoning(output: &str) -> (String, Option<String>) {
    let re = think_re();
    let reasoning: Vec<String> = re
        .captures_iter(output)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|s| !s.is_empty())
        .collect();
    let body = re.replace_all(output, "").trim().to_string();
    let reasoning = (!reasoning.is_empty()).then(|| reasoning.join("\n"));
    (body, reasoning)
}

/// 检测评估文本中的重新考虑措辞，返回包含它的那句话
pub fn detect_reconsideration(text: &str) -> Option<String> {
    let re = reconsider_re();
    text.split(|c: char| matches!(c, '.' | '!' | '?' | '\n'))
        .map(str::trim)
        .find(|sentence| re.is_match(sentence))
        .map(String::from)
}

/// 提取 JSON 片段：```json 代码块、``` 代码块，或第一个 { / [ 到最后一个对应括号
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            let block = rest[..end].trim();
            if block.starts_with('{') || block.starts_with('[') {
                return Some(block);
            }
        }
    }
    let open = trimmed.find(|c: char| c == '{' || c == '[')?;
    let close_char = if trimmed[open..].starts_with('{') { '}' } else { ']' };
    let close = trimmed.rfind(close_char)?;
    (close > open).then(|| &trimmed[open..=close])
}

fn parse_value(output: &str) -> Result<Value, String> {
    let (body, _) = split_reasoning(output);
    let json = extract_json(&body).ok_or_else(|| "no JSON found in reply".to_string())?;
    serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))
}

/// 取对象中第一个存在的键，或把数组本身当作列表
fn list_field<T: DeserializeOwned>(value: Value, keys: &[&str]) -> Result<Vec<T>, String> {
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => keys
            .iter()
            .find_map(|k| map.remove(*k))
            .ok_or_else(|| format!("expected one of {keys:?}"))?,
        other => return Err(format!("unexpected JSON value: {other}")),
    };
    serde_json::from_value(list).map_err(|e| format!("schema mismatch: {e}"))
}

pub fn parse_candidates(output: &str) -> Result<Vec<Candidate>, String> {
    list_field(parse_value(output)?, &["candidates", "tasks", "actions"])
}

#[derive(Debug, Deserialize)]
struct NamedAssessment {
    name: String,
    #[serde(flatten)]
    assessment: Assessment,
}

/// 解析评估：返回 (候选名, 评估)
pub fn parse_assessments(output: &str) -> Result<Vec<(String, Assessment)>, String> {
    let items: Vec<NamedAssessment> = list_field(parse_value(output)?, &["assessments", "evaluations"])?;
    Ok(items
        .into_iter()
        .map(|a| (a.name, a.assessment.normalized()))
        .collect())
}

/// 解析定稿对象（FinalizedTasks / FinalizedActions）
pub fn parse_structured<T: DeserializeOwned>(output: &str) -> Result<T, String> {
    let value = parse_value(output)?;
    serde_json::from_value(value).map_err(|e| format!("schema mismatch: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliberation::FinalizedTasks;

    #[test]
    fn test_split_reasoning() {
        let (body, reasoning) =
            split_reasoning("<think>weigh options</think>\n{\"candidates\": []}");
        assert_eq!(body, "{\"candidates\": []}");
        assert_eq!(reasoning.as_deref(), Some("weigh options"));

        let (body, reasoning) = split_reasoning("plain");
        assert_eq!(body, "plain");
        assert!(reasoning.is_none());
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("Here:\n```\n[1,2]\n```"), Some("[1,2]"));
        assert_eq!(extract_json("result: {\"a\": {\"b\": 1}} done"), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json("[{\"name\":\"x\"}]"), Some("[{\"name\":\"x\"}]"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn test_parse_candidates_object_or_array() {
        let a = parse_candidates(r#"{"candidates":[{"name":"a","steps":["x"]}]}"#).unwrap();
        assert_eq!(a[0].execution_steps, vec!["x"]);
        let b = parse_candidates(r#"[{"name":"a"},{"name":"b"}]"#).unwrap();
        assert_eq!(b.len(), 2);
        assert!(parse_candidates("sorry, I can't").is_err());
        assert!(parse_candidates(r#"{"ideas": []}"#).is_err());
    }

    #[test]
    fn test_parse_assessments_clamps() {
        let parsed = parse_assessments(
            r#"{"assessments":[{"name":"a","feasibility":2,"alignment":0.7,"risk":0.1,"note":"ok"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed[0].0, "a");
        assert_eq!(parsed[0].1.feasibility, 1.0);
    }

    #[test]
    fn test_parse_structured_tasks() {
        let tasks: FinalizedTasks = parse_structured(
            r#"<think>fine</think>{"tasks":[{"name":"t","execution_steps":["notify"]}]}"#,
        )
        .unwrap();
        assert_eq!(tasks.tasks[0].priority, 1.0);
        assert!(parse_structured::<FinalizedTasks>(r#"{"tasks":[{"name":"t"}]}"#).is_err());
    }

    #[test]
    fn test_detect_reconsideration() {
        let text = "The first plan is feasible. Actually, a better approach is to batch the posts. Risk is low.";
        assert_eq!(
            detect_reconsideration(text).as_deref(),
            Some("Actually, a better approach is to batch the posts")
        );
        assert!(detect_reconsideration("All candidates look feasible").is_none());
        // 单词边界：awaiting 不算 wait
        assert!(detect_reconsideration("awaiting approval").is_none());
    }
}
