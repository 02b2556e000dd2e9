//! Runtime policy: what to show, what to allow, how loud to be.
//!
//! The config document is plain YAML next to the binary (or wherever
//! `--config` points). A missing file means defaults; a broken file keeps the
//! previous config. Loaded values are normalized once so the rest of the
//! system can compare tokens without re-trimming.

pub mod watch;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::filters::FilterRule;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Whether the filesystem mirrors the whole cluster or a namespace list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Cluster,
    Namespace,
}

impl Scope {
    fn parse(value: &str) -> Scope {
        match value.trim().to_lowercase().as_str() {
            "namespace" => Scope::Namespace,
            // Unknown scopes fall back to the default.
            _ => Scope::Cluster,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Cluster => write!(f, "cluster"),
            Scope::Namespace => write!(f, "namespace"),
        }
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Scope, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Scope::parse(&raw))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub log_level: String,
    pub scope: Scope,
    pub namespaces: Vec<String>,
    #[serde(rename = "allow")]
    pub allow_rules: Vec<FilterRule>,
    #[serde(rename = "deny")]
    pub deny_rules: Vec<FilterRule>,
    pub allow_create: bool,
    pub allow_delete: bool,
    pub show_managed_fields: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            scope: Scope::Cluster,
            namespaces: Vec::new(),
            allow_rules: Vec::new(),
            deny_rules: Vec::new(),
            allow_create: false,
            allow_delete: false,
            show_managed_fields: false,
        }
    }
}

impl Config {
    pub fn is_cluster_scope(&self) -> bool {
        self.scope == Scope::Cluster
    }

    /// Namespaces the supervisor subscribes in; empty in cluster scope where
    /// every namespace is watched.
    pub fn allowed_namespaces(&self) -> &[String] {
        if self.is_cluster_scope() {
            return &[];
        }
        &self.namespaces
    }

    pub fn allows_namespace(&self, name: &str) -> bool {
        if self.is_cluster_scope() {
            return true;
        }
        self.namespaces.iter().any(|ns| ns == name)
    }

    fn normalize(mut self) -> Config {
        if self.log_level.trim().is_empty() {
            self.log_level = DEFAULT_LOG_LEVEL.to_string();
        }
        self.namespaces = normalize_tokens(self.namespaces);
        self.allow_rules = normalize_rules(self.allow_rules);
        self.deny_rules = normalize_rules(self.deny_rules);
        self
    }
}

/// Load the config document, treating a missing file as defaults.
pub fn load(path: &Path) -> Result<Config> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Config::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read config {}", path.display()));
        }
    };
    parse(&data)
}

/// Parse and normalize a config document. Blank input yields defaults.
pub fn parse(data: &str) -> Result<Config> {
    if data.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = serde_yaml::from_str(data).context("failed to parse config document")?;
    Ok(cfg.normalize())
}

fn normalize_rules(rules: Vec<FilterRule>) -> Vec<FilterRule> {
    rules
        .into_iter()
        .map(|rule| FilterRule {
            api_groups: normalize_tokens(rule.api_groups),
            resources: normalize_tokens(rule.resources),
        })
        .filter(|rule| !rule.api_groups.is_empty() || !rule.resources.is_empty())
        .collect()
}

/// Trim, lowercase, drop empties, dedupe, sort ascending.
fn normalize_tokens(values: Vec<String>) -> Vec<String> {
    let mut result: Vec<String> = values
        .into_iter()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .collect();
    result.sort();
    result.dedup();
    result
}

/// Shared handle to the current config. Readers take a cheap `Arc` snapshot;
/// the hot-reload path swaps the whole value at once.
pub struct ConfigStore {
    current: RwLock<Arc<Config>>,
}

impl ConfigStore {
    pub fn new(cfg: Config) -> Self {
        ConfigStore {
            current: RwLock::new(Arc::new(cfg)),
        }
    }

    pub fn get(&self) -> Arc<Config> {
        self.current.read().expect("config lock poisoned").clone()
    }

    pub fn set(&self, cfg: Config) {
        *self.current.write().expect("config lock poisoned") = Arc::new(cfg);
    }
}
