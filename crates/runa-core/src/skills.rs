// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Progressive-disclosure skill packages.
//!
//! A skill is a directory containing a `SKILL.md` whose front-matter carries
//! the metadata (`name`, `description`, `license`, `compatibility`,
//! `allowedTools`).  Discovery is lightweight — only the front-matter is
//! read.  Activation loads the body and lists bundled `resources/` files.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::warn;

use runa_config::SkillsConfig;

/// Metadata-only view of a discovered skill package.
#[derive(Debug, Clone)]
pub struct SkillPackage {
    pub name: String,
    pub description: String,
    pub license: Option<String>,
    pub compatibility: Option<String>,
    pub allowed_tools: Vec<String>,
    pub trusted: bool,
    /// Directory containing `SKILL.md`.
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawFrontmatter {
    #[serde(default)]
    name: Option<String>,
    description: String,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    compatibility: Option<String>,
    #[serde(default, alias = "allowedTools")]
    allowed_tools: Vec<String>,
    #[serde(default)]
    trusted: bool,
}

/// Split a SKILL.md into `(frontmatter_yaml, body)`.
fn split_frontmatter(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.trim_start_matches('\n').strip_prefix("---")?;
    let close = rest.find("\n---")?;
    let yaml = &rest[..close];
    let body = rest[close + 4..].trim_start_matches('\n');
    Some((yaml, body))
}

fn parse_package(dir: &Path, raw: &str) -> Option<SkillPackage> {
    let (yaml, _body) = split_frontmatter(raw)?;
    let fm: RawFrontmatter = match serde_yaml::from_str(yaml) {
        Ok(fm) => fm,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "skipping skill with malformed front-matter");
            return None;
        }
    };
    if fm.description.trim().is_empty() {
        warn!(dir = %dir.display(), "skipping skill with empty description");
        return None;
    }
    let fallback = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Some(SkillPackage {
        name: fm.name.unwrap_or(fallback),
        description: fm.description,
        license: fm.license,
        compatibility: fm.compatibility,
        allowed_tools: fm.allowed_tools,
        trusted: fm.trusted,
        dir: dir.to_path_buf(),
    })
}

/// Fully loaded skill, produced by activation.
#[derive(Debug, Clone)]
pub(crate) struct ActivatedSkill {
    pub name: String,
    /// SKILL.md body, after the front-matter fence.
    pub body: String,
    /// Relative paths of bundled resource files.
    pub resources: Vec<String>,
}

/// Discovery + activation state for one agent.
pub struct SkillsManager {
    config: SkillsConfig,
    discovered: Mutex<Vec<SkillPackage>>,
    activated: Mutex<Vec<String>>,
}

impl SkillsManager {
    pub fn new(config: SkillsConfig) -> Self {
        Self {
            config,
            discovered: Mutex::new(Vec::new()),
            activated: Mutex::new(Vec::new()),
        }
    }

    /// Scan the configured search paths.  Only front-matter is read.
    pub async fn discover(&self) -> Vec<SkillPackage> {
        let mut found = Vec::new();
        for root in &self.config.search_paths {
            let Ok(entries) = std::fs::read_dir(root) else {
                continue;
            };
            let mut dirs: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            dirs.sort();
            for dir in dirs {
                let skill_md = dir.join("SKILL.md");
                let Ok(raw) = std::fs::read_to_string(&skill_md) else {
                    continue;
                };
                if let Some(pkg) = parse_package(&dir, &raw) {
                    found.push(pkg);
                }
            }
        }
        *self.discovered.lock().await = found.clone();
        found
    }

    pub async fn discovered(&self) -> Vec<SkillPackage> {
        self.discovered.lock().await.clone()
    }

    pub async fn activated(&self) -> Vec<String> {
        self.activated.lock().await.clone()
    }

    pub async fn restore_activated(&self, names: Vec<String>) {
        *self.activated.lock().await = names;
    }

    /// XML block listing discovered skills, appended to the system prompt.
    /// Skills named in `recommend` carry a hint attribute.
    pub async fn prompt_block(&self) -> Option<String> {
        let discovered = self.discovered.lock().await;
        if discovered.is_empty() {
            return None;
        }
        let mut out = String::from("<available_skills>\n");
        for pkg in discovered.iter() {
            let recommended = self.config.recommend.iter().any(|r| r == &pkg.name);
            out.push_str(&format!(
                "  <skill name=\"{}\"{}>{}</skill>\n",
                pkg.name,
                if recommended { " recommended=\"true\"" } else { "" },
                pkg.description.trim()
            ));
        }
        out.push_str("</available_skills>");
        Some(out)
    }

    /// Load the full body (and resource listing) of a discovered skill and
    /// mark it activated.  Returns `None` when the skill is unknown.
    pub(crate) async fn activate(&self, name: &str) -> Option<ActivatedSkill> {
        let pkg = {
            let discovered = self.discovered.lock().await;
            discovered.iter().find(|p| p.name == name).cloned()?
        };
        let raw = std::fs::read_to_string(pkg.dir.join("SKILL.md")).ok()?;
        let (_, body) = split_frontmatter(&raw)?;

        let mut resources = Vec::new();
        for sub in ["scripts", "references", "assets"] {
            let dir = pkg.dir.join("resources").join(sub);
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                if entry.path().is_file() {
                    resources.push(format!(
                        "resources/{sub}/{}",
                        entry.file_name().to_string_lossy()
                    ));
                }
            }
        }
        resources.sort();

        let mut activated = self.activated.lock().await;
        if !activated.iter().any(|a| a == name) {
            activated.push(name.to_string());
        }

        Some(ActivatedSkill {
            name: pkg.name,
            body: body.to_string(),
            resources,
        })
    }

    /// Reminder-message block injected after activation.
    pub(crate) fn activation_block(skill: &ActivatedSkill) -> String {
        let mut out = format!("<activated_skill name=\"{}\">\n{}", skill.name, skill.body);
        if !out.ends_with('\n') {
            out.push('\n');
        }
        if !skill.resources.is_empty() {
            out.push_str("<resources>\n");
            for r in &skill.resources {
                out.push_str(&format!("  {r}\n"));
            }
            out.push_str("</resources>\n");
        }
        out.push_str("</activated_skill>");
        out
    }

    pub fn auto_activate_names(&self) -> Vec<String> {
        self.config.auto_activate.clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, dir_name: &str, front: &str, body: &str) {
        let dir = root.join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("SKILL.md"), format!("---\n{front}\n---\n\n{body}")).unwrap();
    }

    fn manager_for(root: &Path) -> SkillsManager {
        SkillsManager::new(SkillsConfig {
            search_paths: vec![root.to_path_buf()],
            auto_activate: vec![],
            recommend: vec!["deploy".into()],
        })
    }

    #[tokio::test]
    async fn discovery_reads_front_matter_only() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(
            tmp.path(),
            "deploy",
            "name: deploy\ndescription: Deploys the service\nallowedTools: [bash]",
            "Full deploy instructions here.",
        );
        let mgr = manager_for(tmp.path());
        let found = mgr.discover().await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "deploy");
        assert_eq!(found[0].allowed_tools, vec!["bash"]);
        assert!(!found[0].trusted);
    }

    #[tokio::test]
    async fn name_falls_back_to_directory() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "release-notes", "description: Writes notes", "Body.");
        let mgr = manager_for(tmp.path());
        let found = mgr.discover().await;
        assert_eq!(found[0].name, "release-notes");
    }

    #[tokio::test]
    async fn missing_description_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "broken", "name: broken", "Body.");
        let mgr = manager_for(tmp.path());
        assert!(mgr.discover().await.is_empty());
    }

    #[tokio::test]
    async fn prompt_block_marks_recommended() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "deploy", "description: Deploys", "B");
        write_skill(tmp.path(), "other", "description: Other", "B");
        let mgr = manager_for(tmp.path());
        mgr.discover().await;
        let block = mgr.prompt_block().await.unwrap();
        assert!(block.starts_with("<available_skills>"));
        assert!(block.contains("<skill name=\"deploy\" recommended=\"true\">"));
        assert!(block.contains("<skill name=\"other\">"));
    }

    #[tokio::test]
    async fn activation_loads_body_and_resources() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "deploy", "description: Deploys", "Step one.\nStep two.");
        let scripts = tmp.path().join("deploy/resources/scripts");
        std::fs::create_dir_all(&scripts).unwrap();
        std::fs::write(scripts.join("run.sh"), "#!/bin/sh\n").unwrap();

        let mgr = manager_for(tmp.path());
        mgr.discover().await;
        let skill = mgr.activate("deploy").await.unwrap();
        assert!(skill.body.contains("Step one."));
        assert_eq!(skill.resources, vec!["resources/scripts/run.sh"]);
        assert_eq!(mgr.activated().await, vec!["deploy".to_string()]);

        let block = SkillsManager::activation_block(&skill);
        assert!(block.starts_with("<activated_skill name=\"deploy\">"));
        assert!(block.contains("resources/scripts/run.sh"));
    }

    #[tokio::test]
    async fn activating_unknown_skill_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager_for(tmp.path());
        mgr.discover().await;
        assert!(mgr.activate("ghost").await.is_none());
    }

    #[tokio::test]
    async fn activation_is_recorded_once() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "deploy", "description: D", "B");
        let mgr = manager_for(tmp.path());
        mgr.discover().await;
        mgr.activate("deploy").await.unwrap();
        mgr.activate("deploy").await.unwrap();
        assert_eq!(mgr.activated().await.len(), 1);
    }
}
