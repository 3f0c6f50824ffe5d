//! Named prompt templates loaded from a directory of JSON files.
//!
//! Each `<name>.json` holds `{"role": "system" | "user", "content": "..."}`.
//! Templates use `{placeholder}` markers filled in by [`PromptStore::render`].

use anyhow::Context as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};
use tracing::{info, warn};

static PROMPT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap());

pub const SYSTEM_PROMPT: &str = "system";
pub const SUGGEST_REPLY_PROMPT: &str = "suggest_reply";

const DEFAULT_SYSTEM: &str = "You help the user keep up with their private conversations. \
Draft a short, natural reply the user could send next, written in the language of the conversation, \
and provide a Russian translation of that reply so the user can review it. \
Match the tone of the conversation and never invent facts about the user.";

const DEFAULT_SUGGEST_REPLY: &str = "Conversation: {chat_title}\n\
Preferred reply language (may be empty): {language_hint}\n\n\
Recent messages, oldest first, as JSON:\n{messages_json}\n\n\
Suggest the next reply from \"me\". If it answers a specific incoming message, \
set reply_to_message_id to that message's id.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub name: String,
    pub role: PromptRole,
    pub content: String,
}

#[derive(Serialize, Deserialize)]
struct PromptFile {
    role: PromptRole,
    content: String,
}

fn builtin_defaults() -> BTreeMap<String, Prompt> {
    [
        (SYSTEM_PROMPT, PromptRole::System, DEFAULT_SYSTEM),
        (SUGGEST_REPLY_PROMPT, PromptRole::User, DEFAULT_SUGGEST_REPLY),
    ]
    .into_iter()
    .map(|(name, role, content)| {
        (
            name.to_string(),
            Prompt {
                name: name.to_string(),
                role,
                content: content.to_string(),
            },
        )
    })
    .collect()
}

pub struct PromptStore {
    dir: PathBuf,
    prompts: RwLock<BTreeMap<String, Prompt>>,
}

impl PromptStore {
    /// Creates a store holding only the built-in prompts; call [`reload`](Self::reload) to read `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prompts: RwLock::new(builtin_defaults()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-reads every `*.json` file. On error the previously loaded prompts stay in place.
    pub fn reload(&self) -> anyhow::Result<()> {
        let mut prompts = builtin_defaults();

        if self.dir.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)
                .with_context(|| format!("Failed to read prompts directory {:?}", self.dir))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            paths.sort();

            for path in paths {
                let prompt = load_prompt_file(&path)?;
                prompts.insert(prompt.name.clone(), prompt);
            }
        } else {
            warn!(
                "Prompts directory {:?} not found, using built-in prompts",
                self.dir
            );
        }

        let names: Vec<&str> = prompts.keys().map(String::as_str).collect();
        info!("Prompts loaded: {}", names.join(", "));
        *self.prompts.write().unwrap_or_else(|p| p.into_inner()) = prompts;
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.prompts
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> anyhow::Result<Prompt> {
        self.prompts
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Prompt not found: {}", name))
    }

    /// Fills `{key}` markers in one pass. Unknown markers are left as they are, and
    /// substituted values are never scanned again.
    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> anyhow::Result<Prompt> {
        let mut prompt = self.get(name)?;
        prompt.content = PLACEHOLDER_RE
            .replace_all(&prompt.content, |caps: &regex::Captures<'_>| {
                vars.iter()
                    .find(|(key, _)| *key == &caps[1])
                    .map(|(_, value)| value.to_string())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned();
        Ok(prompt)
    }

    /// Writes `<name>.json` and reloads the store.
    pub fn save(&self, name: &str, role: PromptRole, content: &str) -> anyhow::Result<()> {
        let name = name.trim();
        if !PROMPT_NAME_RE.is_match(name) {
            anyhow::bail!("Invalid prompt name: {:?}", name);
        }
        if content.trim().is_empty() {
            anyhow::bail!("Prompt content cannot be empty");
        }

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create prompts directory {:?}", self.dir))?;
        let file = PromptFile {
            role,
            content: format!("{}\n", content.trim_end()),
        };
        let path = self.dir.join(format!("{}.json", name));
        let json = serde_json::to_string_pretty(&file)? + "\n";
        std::fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;

        self.reload()
    }
}

fn load_prompt_file(path: &Path) -> anyhow::Result<Prompt> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid prompt file name {:?}", path))?
        .to_string();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompt {:?}", path))?;
    let file: PromptFile = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to load prompt JSON {:?} (role must be system or user)", path))?;

    let content = file.content.trim().to_string();
    if content.is_empty() {
        anyhow::bail!("Empty prompt content in {:?}", path);
    }
    Ok(Prompt {
        name,
        role: file.role,
        content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::new(dir.path().join("missing"));
        store.reload().unwrap();

        assert_eq!(store.list(), vec!["suggest_reply", "system"]);
        assert_eq!(store.get(SYSTEM_PROMPT).unwrap().role, PromptRole::System);
        assert!(store.get("nope").is_err());
    }

    #[test]
    fn test_files_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("system.json"),
            r#"{"role": "system", "content": "  Be brief.  "}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("greeting.json"),
            r#"{"role": "user", "content": "Hello {name}"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = PromptStore::new(dir.path());
        store.reload().unwrap();
        assert_eq!(store.get("system").unwrap().content, "Be brief.");
        assert_eq!(store.list(), vec!["greeting", "suggest_reply", "system"]);
    }

    #[test]
    fn test_invalid_file_keeps_previous_prompts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("system.json"),
            r#"{"role": "system", "content": "v1"}"#,
        )
        .unwrap();
        let store = PromptStore::new(dir.path());
        store.reload().unwrap();

        std::fs::write(
            dir.path().join("system.json"),
            r#"{"role": "assistant", "content": "v2"}"#,
        )
        .unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.get("system").unwrap().content, "v1");

        std::fs::write(
            dir.path().join("system.json"),
            r#"{"role": "system", "content": "   "}"#,
        )
        .unwrap();
        assert!(store.reload().is_err());
    }

    #[test]
    fn test_render_single_pass() {
        let store = PromptStore::new("unused");
        let prompt = store
            .render(
                SUGGEST_REPLY_PROMPT,
                &[
                    ("chat_title", "Team {language_hint}"),
                    ("language_hint", "en"),
                    ("messages_json", r#"[{"id": 1, "text": "hi"}]"#),
                ],
            )
            .unwrap();

        assert_eq!(prompt.role, PromptRole::User);
        assert!(prompt.content.contains("Conversation: Team {language_hint}"));
        assert!(prompt.content.contains("language (may be empty): en"));
        assert!(prompt.content.contains(r#"[{"id": 1, "text": "hi"}]"#));
    }

    #[test]
    fn test_save_validates_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::new(dir.path().join("prompts"));

        assert!(store.save("../escape", PromptRole::User, "x").is_err());
        assert!(store.save("blank", PromptRole::User, "  \n").is_err());

        store
            .save("suggest_reply", PromptRole::User, "Reply to {chat_title}")
            .unwrap();
        assert_eq!(
            store.get("suggest_reply").unwrap().content,
            "Reply to {chat_title}"
        );
        let on_disk =
            std::fs::read_to_string(dir.path().join("prompts/suggest_reply.json")).unwrap();
        assert!(on_disk.contains("\"role\": \"user\""));
    }
}
