use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use crate::model::profile::{DEFAULT_PROFILE, ProcessProfile};

/// Default directory holding every product namespace.
pub const DEFAULT_BACKLOG_ROOT: &str = "_backlog";

/// `products/<name>/_config/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductConfig {
    #[serde(default)]
    pub product: ProductSection,
    #[serde(default)]
    pub process: ProcessSection,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductSection {
    #[serde(default)]
    pub name: Option<String>,
    /// Identifier prefix; derived from the product name when absent.
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSection {
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Custom profile file, relative to the product root.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Every mutation upserts its row.
    #[default]
    Incremental,
    /// Mutations leave the index alone; it is refreshed by full rebuilds.
    Rebuild,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoRefresh {
    #[default]
    Off,
    Inline,
    Background,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: IndexMode,
    #[serde(default)]
    pub auto_refresh: AutoRefresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_verbosity")]
    pub verbosity: String,
    #[serde(default)]
    pub debug: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            verbosity: default_verbosity(),
            debug: false,
        }
    }
}

impl LogConfig {
    /// Filter directive used when `BACKLOG_LOG` is not set.
    #[must_use]
    pub fn filter_directive(&self) -> &str {
        if self.debug { "debug" } else { &self.verbosity }
    }
}

/// `_shared/defaults.toml` at the backlog root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedDefaults {
    #[serde(default)]
    pub default_product: Option<String>,
}

/// Per-user settings from the platform config directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

fn read_toml<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<T>(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn load_product_config(product_root: &Path) -> Result<ProductConfig> {
    read_toml(&product_root.join("_config/config.toml"))
}

pub fn load_shared_defaults(backlog_root: &Path) -> Result<SharedDefaults> {
    read_toml(&backlog_root.join("_shared/defaults.toml"))
}

pub fn load_user_config() -> Result<UserConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };
    read_toml(&config_dir.join("backlog/config.toml"))
}

/// Pick the product directory: explicit name, else `default_product` from
/// the shared defaults, else the only product present.
pub fn resolve_product_root(backlog_root: &Path, product: Option<&str>) -> Result<PathBuf> {
    let products = backlog_root.join("products");
    if let Some(name) = product {
        return Ok(products.join(name));
    }

    if let Some(name) = load_shared_defaults(backlog_root)?.default_product {
        return Ok(products.join(name));
    }

    let mut found = Vec::new();
    if products.is_dir() {
        for entry in std::fs::read_dir(&products)
            .with_context(|| format!("Failed to list {}", products.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                found.push(entry.path());
            }
        }
    }
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => bail!(
            "no product found under {}; pass --product or run `bkl init`",
            products.display()
        ),
        n => bail!(
            "{n} products under {}; pass --product or set default_product in _shared/defaults.toml",
            products.display()
        ),
    }
}

/// Identifier prefix for a product: configured, else derived from the name
/// (`billing-api` → `BA`, `atlas` → `A`).
pub fn resolve_prefix(config: &ProductConfig, product_name: &str) -> Result<String> {
    let prefix = match config.product.prefix.as_deref() {
        Some(prefix) => prefix.trim().to_string(),
        None => derive_prefix(config.product.name.as_deref().unwrap_or(product_name)),
    };
    validate_prefix(&prefix)?;
    Ok(prefix)
}

fn derive_prefix(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter_map(|run| run.chars().next())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        bail!("product prefix is empty; set [product] prefix in _config/config.toml");
    }
    if !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        bail!("product prefix '{prefix}' must be ASCII alphanumeric");
    }
    Ok(())
}

/// Load the process profile named by the product config.
pub fn resolve_profile(config: &ProductConfig, product_root: &Path) -> Result<ProcessProfile> {
    if let Some(path) = &config.process.path {
        let path = product_root.join(path);
        return ProcessProfile::load(&path)
            .with_context(|| format!("Failed to load process profile {}", path.display()));
    }

    let custom = product_root.join("_config/profile.toml");
    if custom.exists() {
        return ProcessProfile::load(&custom)
            .with_context(|| format!("Failed to load process profile {}", custom.display()));
    }

    ProcessProfile::builtin(&config.process.profile)
        .with_context(|| format!("Unknown process profile '{}'", config.process.profile))
}

/// Output mode for the CLI: `json`, `pretty` or `text`.
#[must_use]
pub fn resolve_output(cli_json: bool, user_output: Option<&str>) -> String {
    resolve_output_with(cli_json, user_output, env::var("BACKLOG_FORMAT").ok().as_deref())
}

fn resolve_output_with(cli_json: bool, user_output: Option<&str>, env_format: Option<&str>) -> String {
    fn normalize_output_mode(raw: &str) -> Option<&'static str> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "human" => Some("pretty"),
            "text" | "table" => Some("text"),
            "json" => Some("json"),
            _ => None,
        }
    }

    if cli_json {
        return "json".to_string();
    }

    if let Some(mode) = env_format.and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if let Some(mode) = user_output.and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if std::io::stdout().is_terminal() {
        "pretty".to_string()
    } else {
        "text".to_string()
    }
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

fn default_verbosity() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_product_config_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_product_config(dir.path()).expect("load should succeed");
        assert_eq!(cfg.process.profile, DEFAULT_PROFILE);
        assert!(!cfg.index.enabled);
        assert_eq!(cfg.index.mode, IndexMode::Incremental);
        assert_eq!(cfg.index.auto_refresh, AutoRefresh::Off);
        assert_eq!(cfg.log.filter_directive(), "info");
    }

    #[test]
    fn product_config_parses_all_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("_config")).expect("mkdir");
        std::fs::write(
            dir.path().join("_config/config.toml"),
            r#"
[product]
name = "billing-api"
prefix = "BILL"

[index]
enabled = true
mode = "rebuild"
auto_refresh = "background"

[log]
debug = true
"#,
        )
        .expect("write");

        let cfg = load_product_config(dir.path()).expect("load");
        assert_eq!(cfg.product.prefix.as_deref(), Some("BILL"));
        assert!(cfg.index.enabled);
        assert_eq!(cfg.index.mode, IndexMode::Rebuild);
        assert_eq!(cfg.index.auto_refresh, AutoRefresh::Background);
        assert_eq!(cfg.log.filter_directive(), "debug");
    }

    #[test]
    fn malformed_config_names_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("_config")).expect("mkdir");
        std::fs::write(dir.path().join("_config/config.toml"), "[index\n").expect("write");
        let err = load_product_config(dir.path()).expect_err("bad toml");
        assert!(format!("{err:#}").contains("config.toml"));
    }

    #[test]
    fn prefix_is_derived_from_product_name() {
        let cfg = ProductConfig::default();
        assert_eq!(resolve_prefix(&cfg, "billing-api").expect("prefix"), "BA");
        assert_eq!(resolve_prefix(&cfg, "atlas").expect("prefix"), "A");

        let mut cfg = ProductConfig::default();
        cfg.product.prefix = Some("APP".into());
        assert_eq!(resolve_prefix(&cfg, "whatever").expect("prefix"), "APP");

        cfg.product.prefix = Some("A-B".into());
        assert!(resolve_prefix(&cfg, "x").is_err());
        cfg.product.prefix = Some(String::new());
        assert!(resolve_prefix(&cfg, "x").is_err());
    }

    #[test]
    fn product_root_resolution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        assert!(resolve_product_root(root, None).is_err());

        std::fs::create_dir_all(root.join("products/atlas")).expect("mkdir");
        assert_eq!(
            resolve_product_root(root, None).expect("single"),
            root.join("products/atlas")
        );

        std::fs::create_dir_all(root.join("products/zephyr")).expect("mkdir");
        assert!(resolve_product_root(root, None).is_err());

        std::fs::create_dir_all(root.join("_shared")).expect("mkdir");
        std::fs::write(root.join("_shared/defaults.toml"), "default_product = \"zephyr\"\n")
            .expect("write");
        assert_eq!(
            resolve_product_root(root, None).expect("default"),
            root.join("products/zephyr")
        );
        assert_eq!(
            resolve_product_root(root, Some("atlas")).expect("explicit"),
            root.join("products/atlas")
        );
    }

    #[test]
    fn profile_resolution_prefers_custom_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = ProductConfig::default();
        let builtin = resolve_profile(&cfg, dir.path()).expect("builtin");
        assert_eq!(builtin.name, DEFAULT_PROFILE);

        let mut cfg = ProductConfig::default();
        cfg.process.profile = "nope".into();
        assert!(resolve_profile(&cfg, dir.path()).is_err());
    }

    #[test]
    fn cli_json_overrides_env_and_config() {
        assert_eq!(resolve_output_with(true, Some("pretty"), Some("text")), "json");
    }

    #[test]
    fn legacy_aliases_are_normalized() {
        assert_eq!(resolve_output_with(false, Some("table"), Some("human")), "pretty");
        assert_eq!(resolve_output_with(false, Some("human"), Some("table")), "text");
        assert_eq!(resolve_output_with(false, Some("json"), Some("bogus")), "json");
    }
}
