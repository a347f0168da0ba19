//! Skill loading and agent skill installation.
//!
//! Skills are markdown documents with a leading attribute block; the loader
//! scans a directory for `*.md` files, parses each, and keeps the valid ones.
//! Installed skills are recorded per agent; the union of their declared tool
//! schemas extends the agent's effective tool set.

pub mod parser;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::Store;
use crate::types::ToolDefinition;

pub use parser::{Skill, SkillParseError, parse_skill};

/// The loaded skill catalog plus per-agent installation records.
pub struct SkillLibrary {
    store: Arc<Store>,
    skills: HashMap<String, Skill>,
}

impl SkillLibrary {
    /// Load all valid skills from `dir`. Unparseable documents are logged
    /// and skipped; a missing directory yields an empty library.
    pub fn load(store: Arc<Store>, dir: &Path) -> Self {
        let mut skills = HashMap::new();
        if dir.is_dir() {
            let mut entries: Vec<_> = match std::fs::read_dir(dir) {
                Ok(entries) => entries.flatten().collect(),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Skills directory unreadable");
                    Vec::new()
                }
            };
            entries.sort_by_key(|e| e.path());

            for entry in entries {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                let content = match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skill file unreadable");
                        continue;
                    }
                };
                match parse_skill(&content) {
                    Ok(skill) => {
                        debug!(skill = %skill.name, tools = skill.tools.len(), "Skill loaded");
                        skills.insert(skill.name.clone(), skill);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping invalid skill");
                    }
                }
            }
        }
        Self { store, skills }
    }

    /// An empty library (no skills directory configured).
    pub fn empty(store: Arc<Store>) -> Self {
        Self {
            store,
            skills: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    /// All loaded skills, sorted by name.
    pub fn list(&self) -> Vec<&Skill> {
        let mut skills: Vec<&Skill> = self.skills.values().collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    /// The union of tool schemas declared by the named skills. Unknown
    /// names are ignored; duplicate tool names keep the first occurrence.
    pub fn skill_tools(&self, skill_names: &[String]) -> Vec<ToolDefinition> {
        let mut seen = std::collections::HashSet::new();
        let mut tools = Vec::new();
        for name in skill_names {
            let Some(skill) = self.skills.get(name) else {
                continue;
            };
            for tool in &skill.tools {
                if seen.insert(tool.name.clone()) {
                    tools.push(tool.clone());
                }
            }
        }
        tools
    }

    /// Install a skill onto an agent. Unknown skills are invalid input.
    pub fn install(&self, agent_id: &Uuid, skill_name: &str) -> Result<()> {
        if !self.skills.contains_key(skill_name) {
            return Err(EngineError::invalid(format!("unknown skill '{skill_name}'")));
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO agent_skills (agent_id, skill_name) VALUES (?1, ?2)",
                rusqlite::params![agent_id.to_string(), skill_name],
            )?;
            Ok(())
        })
    }

    /// Remove a skill from an agent.
    pub fn uninstall(&self, agent_id: &Uuid, skill_name: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM agent_skills WHERE agent_id = ?1 AND skill_name = ?2",
                rusqlite::params![agent_id.to_string(), skill_name],
            )?;
            Ok(())
        })
    }

    /// Installed skill names for an agent, sorted.
    pub fn agent_skills(&self, agent_id: &Uuid) -> Result<Vec<String>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT skill_name FROM agent_skills WHERE agent_id = ?1 ORDER BY skill_name",
            )?;
            let rows = stmt.query_map([agent_id.to_string()], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Effective skill-declared tools for an agent.
    pub fn agent_tools(&self, agent_id: &Uuid) -> Result<Vec<ToolDefinition>> {
        let installed = self.agent_skills(agent_id)?;
        Ok(self.skill_tools(&installed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(dir: &Path, file: &str, name: &str, tool: &str) {
        let content = format!(
            "---\nname: {name}\ndescription: test skill\n---\n\n```tools\n[{{\"name\": \"{tool}\", \"description\": \"d\"}}]\n```\n"
        );
        std::fs::write(dir.join(file), content).unwrap();
    }

    fn library(dir: &Path) -> SkillLibrary {
        let store = Arc::new(Store::open_in_memory().unwrap());
        SkillLibrary::load(store, dir)
    }

    #[test]
    fn test_load_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "alpha.md", "alpha", "alpha_tool");
        write_skill(dir.path(), "beta.md", "beta", "beta_tool");
        std::fs::write(dir.path().join("broken.md"), "no attribute block").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let library = library(dir.path());
        assert_eq!(library.list().len(), 2);
        assert!(library.get("alpha").is_some());
        assert!(library.get("broken").is_none());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let library = library(Path::new("/nonexistent/skills"));
        assert!(library.list().is_empty());
    }

    #[test]
    fn test_skill_tools_union_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "a.md", "a", "shared_tool");
        write_skill(dir.path(), "b.md", "b", "shared_tool");
        let library = library(dir.path());

        let tools = library.skill_tools(&["a".into(), "b".into(), "ghost".into()]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "shared_tool");
    }

    #[test]
    fn test_install_and_agent_tools() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "crm.md", "crm", "crm_pull");
        let library = library(dir.path());
        let agent = Uuid::new_v4();

        library.install(&agent, "crm").unwrap();
        library.install(&agent, "crm").unwrap(); // idempotent
        assert_eq!(library.agent_skills(&agent).unwrap(), vec!["crm"]);
        assert_eq!(library.agent_tools(&agent).unwrap().len(), 1);

        library.uninstall(&agent, "crm").unwrap();
        assert!(library.agent_skills(&agent).unwrap().is_empty());
    }

    #[test]
    fn test_install_unknown_skill_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path());
        assert!(library.install(&Uuid::new_v4(), "ghost").is_err());
    }
}
