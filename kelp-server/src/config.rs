//! Layered TOML configuration.
//!
//! Two files are merged per key: a global `config.toml` under the user's
//! config directory and an in-repo `.kelp.toml`, the repo file winning on
//! conflict. Unrecognized keys produce a warning, never a failure, so a
//! newer config file keeps working against an older binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

/// In-repo configuration file name.
pub const REPO_CONFIG_FILE: &str = ".kelp.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KelpConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub embedding: EmbeddingSection,
    #[serde(default)]
    pub client: ClientSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// HTTP listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Glob patterns excluded from indexing.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    /// History depth for frecency scoring.
    #[serde(default = "default_read_max_commits")]
    pub read_max_commits: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            ignore_patterns: Vec::new(),
            read_max_commits: default_read_max_commits(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSection {
    /// Named embedding provider.
    #[serde(default = "default_embedding_function")]
    pub function: String,
    /// Maximum chunks per upsert batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            function: default_embedding_function(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Transport target for the CLI and other clients.
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_host(),
        }
    }
}

fn default_port() -> u16 {
    4637
}

fn default_read_max_commits() -> usize {
    10_000
}

fn default_embedding_function() -> String {
    "hashed".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_host() -> String {
    format!("http://127.0.0.1:{}", default_port())
}

/// Recognized keys, one entry per `section.key`.
const KNOWN_KEYS: &[(&str, &[&str])] = &[
    ("server", &["port", "ignore_patterns", "read_max_commits"]),
    ("embedding", &["function", "batch_size"]),
    ("client", &["host"]),
];

impl KelpConfig {
    /// Load configuration for a repository: global file merged with the
    /// in-repo file, repo winning per key.
    pub fn load(repo_path: &Path) -> Self {
        let global = global_config_path().and_then(|p| read_config_value(&p));
        let repo = read_config_value(&repo_path.join(REPO_CONFIG_FILE));
        Self::from_values(global, repo)
    }

    fn from_values(global: Option<Value>, repo: Option<Value>) -> Self {
        let merged = match (global, repo) {
            (Some(mut base), Some(over)) => {
                merge_values(&mut base, over);
                base
            }
            (Some(base), None) => base,
            (None, Some(over)) => over,
            (None, None) => return Self::default(),
        };
        warn_unknown_keys(&merged);
        match merged.try_into() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("configuration invalid, using defaults: {err}");
                Self::default()
            }
        }
    }
}

fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kelp").join("config.toml"))
}

fn read_config_value(path: &Path) -> Option<Value> {
    let text = std::fs::read_to_string(path).ok()?;
    match text.parse::<Value>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("ignoring unparseable config {}: {err}", path.display());
            None
        }
    }
}

/// Recursive per-key merge; `over` wins on conflicting leaves.
fn merge_values(base: &mut Value, over: Value) {
    match (base, over) {
        (Value::Table(base_table), Value::Table(over_table)) => {
            for (key, over_value) in over_table {
                match base_table.get_mut(&key) {
                    Some(base_value) => merge_values(base_value, over_value),
                    None => {
                        base_table.insert(key, over_value);
                    }
                }
            }
        }
        (base_slot, over_value) => *base_slot = over_value,
    }
}

fn warn_unknown_keys(value: &Value) {
    let Value::Table(table) = value else {
        return;
    };
    for (section, section_value) in table {
        match KNOWN_KEYS.iter().find(|(name, _)| *name == section.as_str()) {
            None => tracing::warn!("unknown configuration section {section:?}"),
            Some((_, keys)) => {
                if let Value::Table(section_table) = section_value {
                    for key in section_table.keys() {
                        if !keys.contains(&key.as_str()) {
                            tracing::warn!("unknown configuration key {section}.{key}");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(text: &str) -> Value {
        text.parse().unwrap()
    }

    #[test]
    fn defaults_apply_without_any_file() {
        let config = KelpConfig::from_values(None, None);
        assert_eq!(config.server.port, 4637);
        assert_eq!(config.server.read_max_commits, 10_000);
        assert_eq!(config.embedding.function, "hashed");
        assert_eq!(config.embedding.batch_size, 500);
    }

    #[test]
    fn repo_file_wins_per_key() {
        let global = value(
            r#"
            [server]
            port = 9000
            read_max_commits = 50

            [embedding]
            batch_size = 100
            "#,
        );
        let repo = value(
            r#"
            [server]
            port = 9100
            "#,
        );
        let config = KelpConfig::from_values(Some(global), Some(repo));
        // Repo overrides the port but the other global keys survive.
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.read_max_commits, 50);
        assert_eq!(config.embedding.batch_size, 100);
    }

    #[test]
    fn unknown_keys_do_not_fail_loading() {
        let repo = value(
            r#"
            [server]
            port = 9100
            shiny_new_toggle = true

            [experimental]
            thing = 1
            "#,
        );
        let config = KelpConfig::from_values(None, Some(repo));
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn ignore_patterns_come_through_as_a_list() {
        let repo = value(
            r#"
            [server]
            ignore_patterns = ["vendor/**", "*.min.js"]
            "#,
        );
        let config = KelpConfig::from_values(None, Some(repo));
        assert_eq!(config.server.ignore_patterns, vec!["vendor/**", "*.min.js"]);
    }
}
