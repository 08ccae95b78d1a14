use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const SKILL_FILE: &str = "SKILL.md";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SkillLocation {
    Project,
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    pub summary: String,
    pub location: SkillLocation,
    pub path: String,
    #[serde(default)]
    pub trigger_words: Vec<String>,
    #[serde(default)]
    pub force_words: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SkillFrontmatter {
    name: String,
    description: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    trigger_words: Option<Vec<String>>,
    #[serde(default)]
    force_words: Option<Vec<String>>,
    #[serde(default)]
    aliases: Option<Vec<String>>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Split a SKILL.md into `(front_matter_yaml, body)`. Returns `None` when
/// the file carries no front-matter block.
fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    let end = rest.find("\n---")?;
    let yaml = &rest[..end];
    let mut body = &rest[end + 4..];
    body = body.strip_prefix('\r').unwrap_or(body);
    body = body.strip_prefix('\n').unwrap_or(body);
    Some((yaml, body))
}

/// Summary priority: explicit front-matter `summary`, then `description`,
/// then the first non-heading body paragraph.
pub fn skill_summary(content: &str) -> String {
    let (front, body) = match split_front_matter(content) {
        Some((yaml, body)) => (serde_yaml::from_str::<SkillFrontmatter>(yaml).ok(), body),
        None => (None, content),
    };
    if let Some(front) = &front {
        if let Some(summary) = front.summary.as_deref() {
            let summary = summary.trim();
            if !summary.is_empty() {
                return summary.to_string();
            }
        }
        if !front.description.trim().is_empty() {
            return front.description.trim().to_string();
        }
    }
    derive_summary_from_body(body)
}

fn derive_summary_from_body(body: &str) -> String {
    body.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .unwrap_or_default()
        .to_string()
}

/// Truncate for display by rune count, never by byte count. Adds an
/// ellipsis when something was dropped.
pub fn truncate_runes(text: &str, max_runes: usize) -> String {
    if text.chars().count() <= max_runes {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_runes.saturating_sub(1)).collect();
    format!("{kept}…")
}

/// Insert or replace the `summary` front-matter key. An empty summary
/// removes the key; removing the last key drops the whole front-matter
/// block.
pub fn upsert_skill_summary(content: &str, summary: &str) -> String {
    let summary = summary.trim();
    let (yaml, body) = match split_front_matter(content) {
        Some((yaml, body)) => (yaml.to_string(), body.to_string()),
        None => (String::new(), content.to_string()),
    };

    let mut mapping = if yaml.is_empty() {
        serde_yaml::Mapping::new()
    } else {
        serde_yaml::from_str::<serde_yaml::Mapping>(&yaml).unwrap_or_default()
    };

    let key = serde_yaml::Value::String("summary".to_string());
    if summary.is_empty() {
        mapping.remove(&key);
    } else {
        mapping.insert(key, serde_yaml::Value::String(summary.to_string()));
    }

    if mapping.is_empty() {
        return body;
    }
    let yaml = serde_yaml::to_string(&mapping).unwrap_or_default();
    format!("---\n{yaml}---\n{body}")
}

/// Scans skill roots for `<dir>/SKILL.md`. Project-scope skills win over
/// global ones with the same lowercase name.
#[derive(Debug, Clone)]
pub struct SkillService {
    project_root: Option<PathBuf>,
    global_roots: Vec<PathBuf>,
}

impl SkillService {
    pub fn new(project_root: Option<PathBuf>, global_roots: Vec<PathBuf>) -> Self {
        Self {
            project_root,
            global_roots,
        }
    }

    fn skill_roots(&self) -> Vec<(PathBuf, SkillLocation)> {
        let mut roots = Vec::new();
        if let Some(project) = &self.project_root {
            roots.push((project.join(".cadre").join("skills"), SkillLocation::Project));
        }
        for global in &self.global_roots {
            roots.push((global.clone(), SkillLocation::Global));
        }
        roots
    }

    pub fn list_skills(&self) -> Vec<SkillInfo> {
        let mut out = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for (root, location) in self.skill_roots() {
            if !root.is_dir() {
                continue;
            }
            let Ok(entries) = fs::read_dir(&root) else {
                continue;
            };
            for entry in entries.flatten() {
                if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let skill_file = entry.path().join(SKILL_FILE);
                let Ok(content) = fs::read_to_string(&skill_file) else {
                    continue;
                };
                let Some(info) = parse_skill(&content, &entry.path(), location.clone()) else {
                    tracing::debug!(path = %skill_file.display(), "skipping unparseable skill");
                    continue;
                };
                let dedupe = info.name.to_lowercase();
                if !seen.insert(dedupe) {
                    continue;
                }
                out.push(info);
            }
        }
        out.sort_by(|a, b| {
            let rank = |loc: &SkillLocation| match loc {
                SkillLocation::Project => 0,
                SkillLocation::Global => 1,
            };
            rank(&a.location)
                .cmp(&rank(&b.location))
                .then_with(|| a.name.cmp(&b.name))
        });
        out
    }

    pub fn load_skill(&self, name: &str) -> Option<(SkillInfo, String)> {
        let target = name.trim().to_lowercase();
        if target.is_empty() {
            return None;
        }
        self.list_skills()
            .into_iter()
            .find(|info| {
                info.name.to_lowercase() == target
                    || info.aliases.iter().any(|a| a.to_lowercase() == target)
            })
            .and_then(|info| {
                let content = fs::read_to_string(Path::new(&info.path).join(SKILL_FILE)).ok()?;
                Some((info, content))
            })
    }
}

fn parse_skill(content: &str, dir: &Path, location: SkillLocation) -> Option<SkillInfo> {
    let (yaml, _body) = split_front_matter(content)?;
    let front: SkillFrontmatter = serde_yaml::from_str(yaml).ok()?;
    if front.name.trim().is_empty() {
        return None;
    }
    Some(SkillInfo {
        name: front.name.trim().to_string(),
        description: front.description.trim().to_string(),
        summary: skill_summary(content),
        location,
        path: dir.to_string_lossy().into_owned(),
        trigger_words: front.trigger_words.unwrap_or_default(),
        force_words: front.force_words.unwrap_or_default(),
        aliases: front.aliases.unwrap_or_default(),
        tags: front.tags.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "---\nname: deploy\ndescription: Ship the service\nsummary: One-step deploy\ntags:\n  - ops\n---\n# Deploy\n\nRun the pipeline.\n";

    #[test]
    fn summary_prefers_front_matter_summary() {
        assert_eq!(skill_summary(SAMPLE), "One-step deploy");
    }

    #[test]
    fn summary_falls_back_to_description_then_body() {
        let no_summary = "---\nname: x\ndescription: From description\n---\nBody text.\n";
        assert_eq!(skill_summary(no_summary), "From description");

        let bare = "# Title\n\nFirst real paragraph.\n";
        assert_eq!(skill_summary(bare), "First real paragraph.");
    }

    #[test]
    fn truncation_counts_runes_not_bytes() {
        let text = "日本語のテキストです";
        let truncated = truncate_runes(text, 5);
        assert_eq!(truncated.chars().count(), 5);
        assert!(truncated.ends_with('…'));
        // Under the limit nothing changes.
        assert_eq!(truncate_runes("short", 10), "short");
    }

    #[test]
    fn upsert_summary_round_trips() {
        let updated = upsert_skill_summary(SAMPLE, "  Fresh summary  ");
        assert_eq!(skill_summary(&updated), "Fresh summary");
        // Body survives untouched.
        assert!(updated.ends_with("Run the pipeline.\n"));
    }

    #[test]
    fn empty_summary_removes_key_and_lone_block() {
        let only_summary = "---\nsummary: gone soon\n---\nBody stays.\n";
        let removed = upsert_skill_summary(only_summary, "");
        assert_eq!(removed, "Body stays.\n");

        let updated = upsert_skill_summary(SAMPLE, "");
        assert!(updated.starts_with("---\n"));
        assert!(!updated.contains("summary:"));
        assert!(updated.contains("name: deploy"));
    }

    #[test]
    fn upsert_creates_front_matter_when_missing() {
        let bare = "Just a body.\n";
        let updated = upsert_skill_summary(bare, "New summary");
        assert_eq!(skill_summary(&updated), "New summary");
        assert!(updated.contains("Just a body."));
    }

    #[test]
    fn listing_prefers_project_scope_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("proj");
        let global = dir.path().join("global-skills");
        let project_skill = project.join(".cadre").join("skills").join("deploy");
        let global_skill = global.join("deploy");
        let global_other = global.join("review");
        fs::create_dir_all(&project_skill).unwrap();
        fs::create_dir_all(&global_skill).unwrap();
        fs::create_dir_all(&global_other).unwrap();
        fs::write(
            project_skill.join(SKILL_FILE),
            "---\nname: Deploy\ndescription: project copy\n---\n",
        )
        .unwrap();
        fs::write(
            global_skill.join(SKILL_FILE),
            "---\nname: deploy\ndescription: global copy\n---\n",
        )
        .unwrap();
        fs::write(
            global_other.join(SKILL_FILE),
            "---\nname: review\ndescription: review things\naliases:\n  - cr\n---\n",
        )
        .unwrap();

        let service = SkillService::new(Some(project), vec![global]);
        let skills = service.list_skills();
        assert_eq!(skills.len(), 2);
        assert_eq!(skills[0].name, "Deploy");
        assert_eq!(skills[0].description, "project copy");
        assert_eq!(skills[0].location, SkillLocation::Project);

        let (info, _content) = service.load_skill("cr").expect("alias lookup");
        assert_eq!(info.name, "review");
    }
}
