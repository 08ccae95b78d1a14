use anyhow::Context;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use toml::Value as TomlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    User,
    Workspace,
}

#[derive(Debug, Default, Clone)]
struct ConfigLayers {
    user: toml::Table,
    workspace: toml::Table,
}

/// Layered TOML configuration with dotted key paths. The user scope lives
/// at `~/.codex/config.toml` (the shared agent config), the workspace scope
/// at `.codex/config.toml`; workspace values shadow user values.
pub struct ConfigStore {
    user_path: PathBuf,
    workspace_path: Option<PathBuf>,
    layers: RwLock<ConfigLayers>,
}

pub fn default_user_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".codex")
        .join("config.toml")
}

pub fn workspace_config_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".codex").join("config.toml")
}

impl ConfigStore {
    pub async fn load(
        user_path: PathBuf,
        workspace_path: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let user = read_table(&user_path).await?;
        let workspace = match &workspace_path {
            Some(path) => read_table(path).await?,
            None => toml::Table::new(),
        };
        Ok(Self {
            user_path,
            workspace_path,
            layers: RwLock::new(ConfigLayers { user, workspace }),
        })
    }

    /// Effective value at the dotted key path, or the whole merged table
    /// for `None`/empty keys.
    pub async fn read(&self, key: Option<&str>) -> Option<JsonValue> {
        let layers = self.layers.read().await;
        let mut merged = layers.user.clone();
        merge_table(&mut merged, &layers.workspace);
        let merged = TomlValue::Table(merged);
        let value = match key {
            None | Some("") => &merged,
            Some(path) => lookup(&merged, path)?,
        };
        Some(toml_to_json(value))
    }

    pub async fn write(
        &self,
        key: &str,
        value: JsonValue,
        scope: ConfigScope,
    ) -> anyhow::Result<()> {
        if key.trim().is_empty() {
            anyhow::bail!("config key must not be empty");
        }
        let toml_value = json_to_toml(value)?;
        let mut layers = self.layers.write().await;
        let (table, path) = match scope {
            ConfigScope::User => (&mut layers.user, self.user_path.clone()),
            ConfigScope::Workspace => {
                let path = self
                    .workspace_path
                    .clone()
                    .context("no workspace config path configured")?;
                (&mut layers.workspace, path)
            }
        };
        set_path(table, key, toml_value);
        let serialized = toml::to_string_pretty(&*table)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, serialized)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

async fn read_table(path: &Path) -> anyhow::Result<toml::Table> {
    match fs::read_to_string(path).await {
        Ok(raw) => raw
            .parse::<toml::Table>()
            .with_context(|| format!("invalid TOML in {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(toml::Table::new()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn merge_table(base: &mut toml::Table, overlay: &toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(TomlValue::Table(base_sub)), TomlValue::Table(overlay_sub)) => {
                merge_table(base_sub, overlay_sub)
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn lookup<'a>(root: &'a TomlValue, dotted: &str) -> Option<&'a TomlValue> {
    let mut current = root;
    for part in dotted.split('.') {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

fn set_path(table: &mut toml::Table, dotted: &str, value: TomlValue) {
    let mut parts = dotted.split('.').peekable();
    let mut current = table;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| TomlValue::Table(toml::Table::new()));
        if !entry.is_table() {
            *entry = TomlValue::Table(toml::Table::new());
        }
        current = entry.as_table_mut().expect("just ensured a table");
    }
}

fn toml_to_json(value: &TomlValue) -> JsonValue {
    match value {
        TomlValue::String(s) => JsonValue::String(s.clone()),
        TomlValue::Integer(i) => JsonValue::from(*i),
        TomlValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        TomlValue::Boolean(b) => JsonValue::Bool(*b),
        TomlValue::Datetime(dt) => JsonValue::String(dt.to_string()),
        TomlValue::Array(items) => JsonValue::Array(items.iter().map(toml_to_json).collect()),
        TomlValue::Table(table) => JsonValue::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect(),
        ),
    }
}

fn json_to_toml(value: JsonValue) -> anyhow::Result<TomlValue> {
    Ok(match value {
        JsonValue::Null => anyhow::bail!("TOML has no null; delete the key instead"),
        JsonValue::Bool(b) => TomlValue::Boolean(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                TomlValue::Integer(i)
            } else {
                TomlValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => TomlValue::String(s),
        JsonValue::Array(items) => TomlValue::Array(
            items
                .into_iter()
                .map(json_to_toml)
                .collect::<anyhow::Result<Vec<_>>>()?,
        ),
        JsonValue::Object(map) => {
            let mut table = toml::Table::new();
            for (k, v) in map {
                table.insert(k, json_to_toml(v)?);
            }
            TomlValue::Table(table)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dotted_reads_merge_workspace_over_user() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user.toml");
        let workspace = dir.path().join("ws.toml");
        std::fs::write(
            &user,
            "model = \"gpt-large\"\n[sandbox]\npolicy = \"sandbox\"\nlevel = 2\n",
        )
        .unwrap();
        std::fs::write(&workspace, "[sandbox]\npolicy = \"no-sandbox\"\n").unwrap();

        let store = ConfigStore::load(user, Some(workspace)).await.unwrap();
        assert_eq!(
            store.read(Some("sandbox.policy")).await,
            Some(json!("no-sandbox"))
        );
        assert_eq!(store.read(Some("sandbox.level")).await, Some(json!(2)));
        assert_eq!(store.read(Some("model")).await, Some(json!("gpt-large")));
        assert_eq!(store.read(Some("missing.key")).await, None);
    }

    #[tokio::test]
    async fn writes_persist_and_create_nested_tables() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user.toml");
        let store = ConfigStore::load(user.clone(), None).await.unwrap();

        store
            .write("agents.default.model", json!("o4"), ConfigScope::User)
            .await
            .unwrap();
        assert_eq!(
            store.read(Some("agents.default.model")).await,
            Some(json!("o4"))
        );

        // Reload from disk to verify persistence.
        let reloaded = ConfigStore::load(user, None).await.unwrap();
        assert_eq!(
            reloaded.read(Some("agents.default.model")).await,
            Some(json!("o4"))
        );
    }

    #[tokio::test]
    async fn workspace_writes_require_a_workspace_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("user.toml"), None)
            .await
            .unwrap();
        assert!(store
            .write("a.b", json!(1), ConfigScope::Workspace)
            .await
            .is_err());
    }
}
