//! 角色档案：人设、背景、风格与目标
//!
//! 按扩展名从 TOML 或 JSON 加载；渲染后作为每次补全的 system 消息。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleGuide {
    #[serde(default)]
    pub tone: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    /// 基础 system 指令
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub bio: Vec<String>,
    #[serde(default)]
    pub lore: Vec<String>,
    #[serde(default)]
    pub style: StyleGuide,
    #[serde(default)]
    pub topics: Vec<String>,
    /// 长期目标，自主建议任务时作为默认目标
    #[serde(default)]
    pub goals: Vec<String>,
}

impl Default for Character {
    fn default() -> Self {
        Self {
            name: "Tessera".to_string(),
            system: "You are Tessera, an autonomous agent that plans carefully and acts only through the tools it has been given.".to_string(),
            bio: Vec::new(),
            lore: Vec::new(),
            style: StyleGuide {
                tone: vec!["concise".into(), "friendly".into()],
                constraints: vec!["never invent tool names".into()],
            },
            topics: Vec::new(),
            goals: Vec::new(),
        }
    }
}

impl Character {
    /// 按扩展名解析：.json 走 serde_json，其余按 TOML
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AgentError::ConfigError(format!("read character {}: {}", path.display(), e)))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let character: Character = if is_json {
            serde_json::from_str(&text)
                .map_err(|e| AgentError::ConfigError(format!("parse character {}: {}", path.display(), e)))?
        } else {
            toml::from_str(&text)
                .map_err(|e| AgentError::ConfigError(format!("parse character {}: {}", path.display(), e)))?
        };
        if character.name.trim().is_empty() {
            return Err(AgentError::ConfigError(format!(
                "character {} has no name",
                path.display()
            )));
        }
        tracing::info!(name = %character.name, path = %path.display(), "character loaded");
        Ok(character)
    }

    /// 有路径则加载，否则使用默认角色
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, AgentError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn system_prompt(&self) -> String {
        let mut s = String::new();
        if self.system.trim().is_empty() {
            s.push_str(&format!("You are {}.", self.name));
        } else {
            s.push_str(self.system.trim());
        }
        push_list(&mut s, "Bio", &self.bio);
        push_list(&mut s, "Lore", &self.lore);
        push_list(&mut s, "Tone", &self.style.tone);
        push_list(&mut s, "Constraints", &self.style.constraints);
        push_list(&mut s, "Topics", &self.topics);
        push_list(&mut s, "Goals", &self.goals);
        s
    }

    /// 自主建议使用的目标描述
    pub fn goal_objective(&self) -> Option<String> {
        (!self.goals.is_empty()).then(|| self.goals.join("; "))
    }
}

fn push_list(s: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    s.push_str(&format!("\n\n{title}:"));
    for item in items {
        s.push_str(&format!("\n- {item}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_toml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("nova.toml");
        std::fs::write(
            &toml_path,
            "name = \"Nova\"\nsystem = \"You are Nova.\"\nbio = [\"community lead\"]\n[style]\ntone = [\"warm\"]\n",
        )
        .unwrap();
        let c = Character::load(&toml_path).unwrap();
        assert_eq!(c.name, "Nova");
        assert_eq!(c.style.tone, vec!["warm".to_string()]);

        let json_path = dir.path().join("nova.json");
        std::fs::write(&json_path, r#"{"name":"Nova","goals":["grow the community"]}"#).unwrap();
        let c = Character::load(&json_path).unwrap();
        assert_eq!(c.goal_objective().as_deref(), Some("grow the community"));
    }

    #[test]
    fn test_missing_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anon.json");
        std::fs::write(&path, r#"{"name":"  "}"#).unwrap();
        assert!(matches!(Character::load(&path), Err(AgentError::ConfigError(_))));
    }

    #[test]
    fn test_system_prompt_sections() {
        let c = Character {
            topics: vec!["defi".into()],
            ..Character::default()
        };
        let prompt = c.system_prompt();
        assert!(prompt.starts_with("You are Tessera"));
        assert!(prompt.contains("Topics:\n- defi"));
        assert!(!prompt.contains("Bio:"));
    }
}
