use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

use crate::model::ContentKind;

pub const DEFAULT_USER_AGENT: &str = "wpimport/0.2";
pub const DEFAULT_API_PATH: &str = "/wp-json/wp/v2";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ImportConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub migration: MigrationSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    pub url: Option<String>,
    pub api_path: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrationSection {
    #[serde(default)]
    pub kinds: Vec<String>,
    pub workers: Option<usize>,
    pub write_timeout_ms: Option<u64>,
    pub fetch_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub import_media: Option<bool>,
    pub author_required: Option<bool>,
}

impl MigrationSection {
    /// Parse `kinds`, accepting singular or plural names. Empty means "all but media".
    pub fn content_kinds(&self) -> Result<Vec<ContentKind>> {
        let mut kinds = Vec::with_capacity(self.kinds.len());
        for name in &self.kinds {
            let Some(kind) = ContentKind::from_name(name) else {
                bail!("unknown content kind in [migration] kinds: {name}");
            };
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }
}

impl ImportConfig {
    /// Resolve the WordPress site URL: env WP_SOURCE_URL > config > None.
    pub fn source_url(&self) -> Option<String> {
        env_override("WP_SOURCE_URL").or_else(|| {
            self.source
                .url
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        })
    }

    /// Resolve the REST prefix: env WP_API_PATH > config > DEFAULT_API_PATH.
    pub fn api_path(&self) -> String {
        env_override("WP_API_PATH")
            .or_else(|| self.source.api_path.clone())
            .unwrap_or_else(|| DEFAULT_API_PATH.to_string())
    }

    /// Resolve user agent: env WP_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WP_USER_AGENT")
            .or_else(|| self.source.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn http_timeout_ms(&self) -> u64 {
        env_override("WP_HTTP_TIMEOUT_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.source.timeout_ms)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS)
    }

    pub fn page_size(&self) -> usize {
        self.source.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    /// Full REST base, e.g. `https://blog.example.org/wp-json/wp/v2`.
    pub fn api_base_url(&self) -> Option<String> {
        self.source_url()
            .map(|url| join_api_base(&url, &self.api_path()))
    }
}

/// Load and parse an ImportConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ImportConfig> {
    if !config_path.exists() {
        return Ok(ImportConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ImportConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Default)]
pub struct SourceConfigPatch {
    pub set_url: Option<String>,
    pub set_api_path: Option<String>,
}

/// Update selected keys under `[source]` while preserving all other config sections.
/// Returns `true` when a write occurred.
pub fn patch_source_config(config_path: &Path, patch: &SourceConfigPatch) -> Result<bool> {
    if patch.set_url.is_none() && patch.set_api_path.is_none() {
        return Ok(false);
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;
    let source_entry = root_table
        .entry("source".to_string())
        .or_insert_with(|| Value::Table(Default::default()));
    let source_table = source_entry
        .as_table_mut()
        .ok_or_else(|| anyhow::anyhow!("[source] must be a table in {}", config_path.display()))?;

    if let Some(url) = &patch.set_url {
        let trimmed = url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            bail!("source url cannot be empty");
        }
        source_table.insert("url".to_string(), Value::String(trimmed.to_string()));
    }
    if let Some(api_path) = &patch.set_api_path {
        source_table.insert("api_path".to_string(), Value::String(api_path.clone()));
    }

    if root == original {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

/// Join a site URL and REST prefix without doubling slashes.
pub fn join_api_base(site_url: &str, api_path: &str) -> String {
    let site = site_url.trim().trim_end_matches('/');
    let path = api_path.trim().trim_matches('/');
    if path.is_empty() {
        site.to_string()
    } else {
        format!("{site}/{path}")
    }
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
