//! Skill document parser.
//!
//! A skill document carries a leading attribute block between `---`
//! delimiters (key: value pairs with simple list syntax) followed by a
//! markdown body. Tool schemas live in fenced code blocks tagged `tools`,
//! each containing a JSON list of `{name, description, parameters}` objects.
//! Malformed tool blocks are skipped, not fatal.

use serde::Deserialize;

use crate::types::ToolDefinition;

/// Error when parsing a skill document.
#[derive(Debug, thiserror::Error)]
pub enum SkillParseError {
    #[error("No attribute block found (expected --- delimiters)")]
    NoAttributes,
    #[error("Invalid attribute block: {0}")]
    InvalidAttributes(String),
    #[error("Missing required attribute: {0}")]
    MissingAttribute(String),
}

/// A parsed skill document.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub version: String,
    pub tags: Vec<String>,
    pub tools: Vec<ToolDefinition>,
    pub body: String,
}

#[derive(Debug, Deserialize)]
struct Attributes {
    name: Option<String>,
    description: Option<String>,
    version: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Parse a skill document into a [`Skill`].
pub fn parse_skill(content: &str) -> Result<Skill, SkillParseError> {
    let (attributes_str, body) = extract_attributes(content)?;

    let attributes: Attributes = serde_yaml::from_str(&attributes_str)
        .map_err(|e| SkillParseError::InvalidAttributes(e.to_string()))?;

    let name = attributes
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or(SkillParseError::MissingAttribute("name".into()))?;

    let tools = parse_tool_blocks(&body);

    Ok(Skill {
        name,
        description: attributes.description.unwrap_or_default(),
        version: attributes.version.unwrap_or_else(|| "0.1.0".into()),
        tags: attributes.tags,
        tools,
        body: body.trim().to_string(),
    })
}

/// Extract the attribute block between the leading `---` delimiters.
fn extract_attributes(content: &str) -> Result<(String, String), SkillParseError> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        return Err(SkillParseError::NoAttributes);
    }
    let after_first = &trimmed[3..];
    let end = after_first
        .find("\n---")
        .ok_or(SkillParseError::NoAttributes)?;
    let attributes = after_first[..end].trim().to_string();
    let body = after_first[end + 4..].to_string();
    Ok((attributes, body))
}

/// Collect tool definitions from every fenced block tagged `tools`.
/// A block that fails to parse, or an entry missing its name, is skipped.
fn parse_tool_blocks(body: &str) -> Vec<ToolDefinition> {
    let mut tools = Vec::new();
    let mut in_block = false;
    let mut block = String::new();

    for line in body.lines() {
        if !in_block {
            if line.trim_start().starts_with("```tools") {
                in_block = true;
                block.clear();
            }
            continue;
        }
        if line.trim_start().starts_with("```") {
            in_block = false;
            tools.extend(parse_tool_list(&block));
            continue;
        }
        block.push_str(line);
        block.push('\n');
    }

    tools
}

#[derive(Debug, Deserialize)]
struct ToolEntry {
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default = "default_parameters")]
    parameters: serde_json::Value,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

fn parse_tool_list(block: &str) -> Vec<ToolDefinition> {
    let entries: Vec<ToolEntry> = match serde_json::from_str(block) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed tools block");
            return Vec::new();
        }
    };
    entries
        .into_iter()
        .filter_map(|entry| {
            let name = entry.name?;
            if name.trim().is_empty() {
                return None;
            }
            Some(ToolDefinition {
                name,
                description: entry.description,
                parameters: entry.parameters,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_SKILL: &str = r#"---
name: crm-sync
description: Keeps the CRM table in sync with the task board
version: 1.2.0
tags:
  - crm
  - sync
---

# CRM Sync

Reads leads from the source-of-record and mirrors task state.

```tools
[
  {
    "name": "crm_pull_leads",
    "description": "Pull open leads from the CRM table",
    "parameters": {"type": "object", "properties": {"stage": {"type": "string"}}}
  },
  {
    "name": "crm_mark_won",
    "description": "Mark a lead as won",
    "parameters": {"type": "object", "properties": {"lead_id": {"type": "string"}}, "required": ["lead_id"]}
  }
]
```

More prose after the block.
"#;

    #[test]
    fn test_parse_valid_skill() {
        let skill = parse_skill(VALID_SKILL).unwrap();
        assert_eq!(skill.name, "crm-sync");
        assert_eq!(skill.version, "1.2.0");
        assert_eq!(skill.tags, vec!["crm", "sync"]);
        assert_eq!(skill.tools.len(), 2);
        assert_eq!(skill.tools[0].name, "crm_pull_leads");
        assert_eq!(skill.tools[1].name, "crm_mark_won");
        assert!(skill.tools[1].parameters["required"].is_array());
        assert!(skill.body.contains("# CRM Sync"));
    }

    #[test]
    fn test_missing_name_rejected() {
        let content = "---\ndescription: no name\n---\nbody";
        assert!(matches!(
            parse_skill(content),
            Err(SkillParseError::MissingAttribute(_))
        ));
    }

    #[test]
    fn test_no_attribute_block_rejected() {
        assert!(matches!(
            parse_skill("# Just markdown"),
            Err(SkillParseError::NoAttributes)
        ));
    }

    #[test]
    fn test_malformed_tools_block_skipped() {
        let content = r#"---
name: broken
---

```tools
[{"name": "ok-tool"}]
```

```tools
this is not json
```
"#;
        let skill = parse_skill(content).unwrap();
        // The valid block survives; the malformed one is dropped.
        assert_eq!(skill.tools.len(), 1);
        assert_eq!(skill.tools[0].name, "ok-tool");
    }

    #[test]
    fn test_entries_without_names_skipped() {
        let content = r#"---
name: partial
---
```tools
[{"description": "anonymous"}, {"name": "named"}]
```
"#;
        let skill = parse_skill(content).unwrap();
        assert_eq!(skill.tools.len(), 1);
        assert_eq!(skill.tools[0].name, "named");
    }

    #[test]
    fn test_skill_without_tools() {
        let content = "---\nname: prose-only\n---\nJust instructions.";
        let skill = parse_skill(content).unwrap();
        assert!(skill.tools.is_empty());
        assert_eq!(skill.body, "Just instructions.");
    }

    #[test]
    fn test_default_parameters_object() {
        let content = r#"---
name: defaults
---
```tools
[{"name": "bare"}]
```
"#;
        let skill = parse_skill(content).unwrap();
        assert_eq!(skill.tools[0].parameters["type"], "object");
    }

    #[test]
    fn test_other_fenced_blocks_ignored() {
        let content = r#"---
name: mixed
---
```json
{"name": "not-a-tool"}
```
```tools
[{"name": "real-tool"}]
```
"#;
        let skill = parse_skill(content).unwrap();
        assert_eq!(skill.tools.len(), 1);
        assert_eq!(skill.tools[0].name, "real-tool");
    }
}
