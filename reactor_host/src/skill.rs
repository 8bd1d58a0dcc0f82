//! Skill documents (`SKILL.md`) and the process-wide skill registry.
//!
//! A skill document either opens with a `---` delimited YAML block carrying
//! `name` and `description`, or follows the legacy layout where the first
//! `#` heading is the name and the paragraph beneath it the description.
//! Both layouts may contain `## Context Keywords`, `## Tools`,
//! `## Instructions` and `## Examples` sections.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub context_keywords: Vec<String>,
    /// Tool names referenced by the document; not checked against loaded tools.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub plugin_name: Option<String>,
}

static FRONTMATTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\A---[ \t]*\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n|\z)").unwrap());
static LEGACY_TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#\s+(.+)$").unwrap());
static LEGACY_DESCRIPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\A#[^\n]+\n\n(.+?)(?:\n\n|\n#|\z)").unwrap());
static CONTEXT_SECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?si)##\s+Context(?:\s+Keywords?)?[ \t]*\n(.+?)(?:\n##|\z)").unwrap()
});
static TOOLS_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?si)##\s+Tools?[ \t]*\n(.+?)(?:\n##|\z)").unwrap());
static INSTRUCTIONS_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?si)##\s+Instructions?[ \t]*\n(.+?)(?:\n##|\z)").unwrap());
static EXAMPLES_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?si)##\s+Examples?[ \t]*\n(.+?)(?:\n##|\z)").unwrap());
static BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*[-*]\s+(.+)$").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^`([^`]+)`").unwrap());
static CODE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"```[\s\S]*?```").unwrap());
static NUMBERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\d+\.\s+(.+)$").unwrap());

#[derive(Deserialize)]
struct Frontmatter {
    name: Option<String>,
    description: Option<String>,
}

/// Read and parse a skill document. Any failure is logged and yields `None`.
pub fn parse_skill_file(path: &Path, plugin_name: &str) -> Option<Skill> {
    match std::fs::read_to_string(path) {
        Ok(content) => Some(parse_skill(&content, plugin_name)),
        Err(e) => {
            error!("Failed to parse SKILL.md for {}: {}", plugin_name, e);
            None
        }
    }
}

/// Parse a skill document. Missing sections yield empty defaults.
pub fn parse_skill(content: &str, plugin_name: &str) -> Skill {
    let mut name = plugin_name.to_string();
    let description: String;

    let body = match FRONTMATTER.captures(content) {
        Some(caps) => {
            let rest = &content[caps.get(0).map_or(0, |m| m.end())..];
            match serde_yaml::from_str::<Frontmatter>(&caps[1]) {
                Ok(meta) => {
                    if let Some(n) = meta.name.filter(|n| !n.trim().is_empty()) {
                        name = n;
                    }
                    description = meta.description.unwrap_or_default();
                }
                Err(e) => {
                    debug!("Unreadable frontmatter for {}, using heading layout: {}", plugin_name, e);
                    (name, description) = legacy_header(rest, plugin_name);
                }
            }
            rest
        }
        None => {
            (name, description) = legacy_header(content, plugin_name);
            content
        }
    };

    Skill {
        name,
        description,
        context_keywords: context_keywords(body),
        tools: tools(body),
        instructions: section(&INSTRUCTIONS_SECTION, body).unwrap_or_default(),
        examples: examples(body),
        plugin_name: Some(plugin_name.to_string()),
    }
}

fn legacy_header(content: &str, plugin_name: &str) -> (String, String) {
    let name = LEGACY_TITLE
        .captures(content)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_else(|| plugin_name.to_string());
    let description = LEGACY_DESCRIPTION
        .captures(content.trim_start())
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();
    (name, description)
}

fn section(pattern: &Regex, body: &str) -> Option<String> {
    pattern.captures(body).map(|c| c[1].trim().to_string())
}

fn context_keywords(body: &str) -> Vec<String> {
    let Some(text) = section(&CONTEXT_SECTION, body) else {
        return Vec::new();
    };
    let bullets: Vec<String> = BULLET
        .captures_iter(&text)
        .map(|c| c[1].trim().to_string())
        .collect();
    if !bullets.is_empty() {
        return bullets;
    }
    text.split(',')
        .map(str::trim)
        .filter(|kw| !kw.is_empty())
        .map(str::to_string)
        .collect()
}

fn tools(body: &str) -> Vec<String> {
    let Some(text) = section(&TOOLS_SECTION, body) else {
        return Vec::new();
    };
    BULLET
        .captures_iter(&text)
        .filter_map(|c| {
            let entry = c[1].trim();
            let tool = match INLINE_CODE.captures(entry) {
                Some(code) => code[1].trim().to_string(),
                // `name - description` without code markers
                None => entry
                    .split(" - ")
                    .next()
                    .unwrap_or(entry)
                    .trim_matches('`')
                    .trim()
                    .to_string(),
            };
            (!tool.is_empty()).then_some(tool)
        })
        .collect()
}

fn examples(body: &str) -> Vec<String> {
    let Some(text) = section(&EXAMPLES_SECTION, body) else {
        return Vec::new();
    };
    let blocks: Vec<String> = CODE_BLOCK
        .find_iter(&text)
        .map(|m| m.as_str().to_string())
        .collect();
    if !blocks.is_empty() {
        return blocks;
    }
    NUMBERED
        .captures_iter(&text)
        .map(|c| c[1].trim().to_string())
        .collect()
}

/// Registry of skills contributed by loaded plugins, keyed by skill name.
#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: RwLock<HashMap<String, Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a skill, replacing any skill with the same name.
    pub fn register(&self, skill: Skill) {
        let mut skills = self.skills.write();
        if skills.contains_key(&skill.name) {
            warn!("Skill {} already registered, overwriting", skill.name);
        }
        info!(
            "Registered skill: {} (plugin: {})",
            skill.name,
            skill.plugin_name.as_deref().unwrap_or("-")
        );
        skills.insert(skill.name.clone(), skill);
    }

    pub fn get(&self, name: &str) -> Option<Skill> {
        self.skills.read().get(name).cloned()
    }

    /// Skills with at least one keyword contained in `context` (case-insensitive).
    pub fn by_context(&self, context: &str) -> Vec<Skill> {
        let context = context.to_lowercase();
        let mut matching: Vec<Skill> = self
            .skills
            .read()
            .values()
            .filter(|skill| {
                skill
                    .context_keywords
                    .iter()
                    .any(|kw| context.contains(&kw.to_lowercase()))
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));
        matching
    }

    pub fn all(&self) -> Vec<Skill> {
        let mut skills: Vec<Skill> = self.skills.read().values().cloned().collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    pub fn len(&self) -> usize {
        self.skills.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.read().is_empty()
    }

    pub fn clear(&self) {
        self.skills.write().clear();
    }

    /// Render one skill as a markdown block for an agent prompt.
    pub fn format_skill(skill: &Skill) -> String {
        let mut parts = vec![
            format!("# Skill: {}", skill.name),
            format!("\n{}\n", skill.description),
        ];

        if !skill.context_keywords.is_empty() {
            parts.push(format!(
                "**Context Keywords**: {}",
                skill.context_keywords.join(", ")
            ));
        }

        if !skill.tools.is_empty() {
            parts.push("\n**Available Tools**:".to_string());
            parts.extend(skill.tools.iter().map(|t| format!("- `{}`", t)));
        }

        if !skill.instructions.is_empty() {
            parts.push(format!("\n**Instructions**:\n{}", skill.instructions));
        }

        if !skill.examples.is_empty() {
            parts.push("\n**Examples**:".to_string());
            for (i, example) in skill.examples.iter().enumerate() {
                if example.contains('\n') {
                    parts.push(format!("\n{}.\n{}", i + 1, example));
                } else {
                    parts.push(format!("\n{}. {}", i + 1, example));
                }
            }
        }

        parts.join("\n")
    }

    /// Skill context for an agent prompt. With a query, only matching skills
    /// are included; an empty string means nothing relevant is registered.
    pub fn context_for_agent(&self, context: Option<&str>) -> String {
        let skills = match context {
            Some(query) => self.by_context(query),
            None => self.all(),
        };
        if skills.is_empty() {
            return String::new();
        }

        let mut parts = vec![
            "# Available Agent Skills".to_string(),
            "\nThe following skills are available from loaded plugins:\n".to_string(),
        ];
        for skill in &skills {
            parts.push(Self::format_skill(skill));
            parts.push("\n---\n".to_string());
        }
        parts.join("\n")
    }
}
