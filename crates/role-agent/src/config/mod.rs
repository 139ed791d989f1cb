use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "role-agent.toml";
pub const DEFAULT_API_URL: &str = "https://api.dify.ai/v1";
pub const DEFAULT_VALUE_MAX_LEN: usize = 48;
pub const DEFAULT_GROUP_SIZE: usize = 5;

pub const ENV_APP_ID: &str = "ROLE_AGENT_APP_ID";
pub const ENV_API_KEY: &str = "ROLE_AGENT_API_KEY";
pub const ENV_API_URL: &str = "ROLE_AGENT_API_URL";
pub const ENV_IS_WORKFLOW: &str = "ROLE_AGENT_IS_WORKFLOW";

fn default_api_url() -> String {
    DEFAULT_API_URL.into()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_title() -> String {
    "Role Awareness Agent".into()
}

fn default_value_max_len() -> usize {
    DEFAULT_VALUE_MAX_LEN
}

fn default_group_size() -> usize {
    DEFAULT_GROUP_SIZE
}

fn default_log_file() -> String {
    "role-agent.log".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub app_id: String,
    pub api_key: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    // Empty means "generate one per session".
    pub user: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            api_key: String::new(),
            api_url: default_api_url(),
            timeout_secs: default_timeout_secs(),
            user: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppInfo {
    #[serde(default = "default_title")]
    pub title: String,
    pub description: String,
    pub copyright: String,
    pub privacy_policy: String,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            title: default_title(),
            description: String::new(),
            copyright: String::new(),
            privacy_policy: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub is_workflow: bool,
    #[serde(default = "default_value_max_len")]
    pub default_value_max_len: usize,
    #[serde(default = "default_group_size")]
    pub group_size: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            is_workflow: false,
            default_value_max_len: default_value_max_len(),
            group_size: default_group_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    // TUI sessions log here; the CLI logs to stderr.
    #[serde(default = "default_log_file")]
    pub file: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub app: AppInfo,
    pub generation: GenerationConfig,
    pub log: LogConfig,
}

impl Config {
    pub fn has_app_credentials(&self) -> bool {
        !self.api.app_id.trim().is_empty() && !self.api.api_key.trim().is_empty()
    }

    pub fn group_size(&self) -> usize {
        self.generation.group_size.max(1)
    }

    pub fn default_value_max_len(&self) -> usize {
        if self.generation.default_value_max_len == 0 {
            DEFAULT_VALUE_MAX_LEN
        } else {
            self.generation.default_value_max_len
        }
    }

    // Environment wins over the file. `lookup` is injected so tests stay hermetic.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_APP_ID).filter(|v| !v.trim().is_empty()) {
            self.api.app_id = v.trim().to_string();
        }
        if let Some(v) = lookup(ENV_API_KEY).filter(|v| !v.trim().is_empty()) {
            self.api.api_key = v.trim().to_string();
        }
        if let Some(v) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api.api_url = v.trim().to_string();
        }
        if let Some(v) = lookup(ENV_IS_WORKFLOW) {
            self.generation.is_workflow =
                matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "YES");
        }
    }

    pub fn ensure_session_user(&mut self) {
        if self.api.user.trim().is_empty() {
            self.api.user = format!("role-agent-{}", uuid::Uuid::new_v4());
        }
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    // Single-parent extends: the parent is loaded first and this file is layered on top.
    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let base_path = resolve_ref_path(path, ext);
        out = load_value_inner(&base_path, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load_value(path: &Path) -> Result<Value> {
    let mut stack = HashSet::<PathBuf>::new();
    load_value_inner(path, &mut stack)
}

pub fn from_value(value: Value) -> Result<Config> {
    value
        .try_into()
        .map_err(|e| Error::msg(format!("invalid configuration: {e}")))
}

// A missing file is only an error when the caller named it explicitly.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let cfg = match path {
        Some(p) => from_value(load_value(p)?)?,
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                from_value(load_value(default)?)?
            } else {
                Config::default()
            }
        }
    };
    Ok(cfg)
}

// Loads `.env` (if any), the TOML file and the environment overrides, in that order.
pub fn load_with_env(path: Option<&Path>) -> Result<Config> {
    dotenv::dotenv().ok();
    let mut cfg = load(path)?;
    cfg.apply_env(|k| std::env::var(k).ok());
    cfg.ensure_session_user();
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_platform_template() {
        let cfg = Config::default();
        assert_eq!(cfg.api.api_url, DEFAULT_API_URL);
        assert_eq!(cfg.generation.default_value_max_len, 48);
        assert_eq!(cfg.group_size(), 5);
        assert!(!cfg.has_app_credentials());
    }

    #[test]
    fn extends_layers_child_over_parent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("base.toml"),
            r#"
[api]
app_id = "base-app"
api_key = "base-key"

[generation]
group_size = 3
"#,
        )
        .unwrap();
        let child = dir.path().join("child.toml");
        fs::write(
            &child,
            r#"
extends = "base.toml"

[api]
api_key = "child-key"
"#,
        )
        .unwrap();

        let cfg = load(Some(&child)).unwrap();
        assert_eq!(cfg.api.app_id, "base-app");
        assert_eq!(cfg.api.api_key, "child-key");
        assert_eq!(cfg.generation.group_size, 3);
        assert_eq!(cfg.generation.default_value_max_len, 48);
    }

    #[test]
    fn extends_cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.toml");
        fs::write(&a, "extends = \"b.toml\"\n").unwrap();
        fs::write(dir.path().join("b.toml"), "extends = \"a.toml\"\n").unwrap();
        let err = load(Some(&a)).unwrap_err().to_string();
        assert!(err.contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = Config::default();
        cfg.api.app_id = "from-file".into();
        cfg.apply_env(|k| match k {
            ENV_APP_ID => Some("from-env".into()),
            ENV_API_KEY => Some("  key  ".into()),
            ENV_IS_WORKFLOW => Some("true".into()),
            _ => None,
        });
        assert_eq!(cfg.api.app_id, "from-env");
        assert_eq!(cfg.api.api_key, "key");
        assert!(cfg.generation.is_workflow);
        assert!(cfg.has_app_credentials());
    }

    #[test]
    fn session_user_is_generated_once() {
        let mut cfg = Config::default();
        cfg.ensure_session_user();
        let first = cfg.api.user.clone();
        assert!(first.starts_with("role-agent-"));
        cfg.ensure_session_user();
        assert_eq!(cfg.api.user, first);
    }
}
