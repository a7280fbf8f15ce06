// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Mount Configuration Types
//
// Defines the configuration schema for one overlay mount:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Source directory and NFS export binding
// - Vault subtree and secret source
// - Analysis queue sizing, retries and auto-organization rules
// - Magic view settings (conversions, context bundles, API feeds)
// - License check endpoint

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::job::JobKind;

pub const API_VERSION: &str = "eidetic/v1";
pub const KIND: &str = "MountConfig";

/// Top-level Kubernetes-style mount configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfigManifest {
    /// API version (must be "eidetic/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "MountConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: MountSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable mount name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Mount configuration specification (content under spec:)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    /// Directory being overlaid. The store lives in `<source>/.eidetic`.
    #[serde(default = "default_source")]
    pub source: PathBuf,

    #[serde(default)]
    pub nfs: NfsConfig,

    #[serde(default)]
    pub vault: VaultConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub views: ViewsConfig,

    #[serde(default)]
    pub license: LicenseConfig,

    /// Mirror committed plaintext, renames and deletes back into the source tree.
    #[serde(default = "default_true")]
    pub mirror_writes: bool,

    /// Flush the index to disk after every committed mutation.
    #[serde(default = "default_true")]
    pub durable_commits: bool,

    /// Offset writes to a file are buffered and committed as one version
    /// once the file has been idle this long. Zero commits every write.
    #[serde(with = "humantime_serde", default = "default_write_settle")]
    pub write_settle: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NfsConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_nfs_port")]
    pub port: u16,

    /// UID/GID reported for every entry.
    #[serde(default = "default_owner")]
    pub uid: u32,

    #[serde(default = "default_owner")]
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Mount path of the encrypted subtree.
    #[serde(default = "default_vault_root")]
    pub root: String,

    /// Environment variable holding the vault secret. Unset means the vault
    /// is locked: reads and writes under `root` are refused.
    #[serde(default = "default_vault_secret_env")]
    pub secret_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Bounded queue capacity. A full queue drops new jobs.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between retries, doubled per attempt.
    #[serde(with = "humantime_serde", default = "default_retry_backoff")]
    pub retry_backoff: Duration,

    #[serde(with = "humantime_serde", default = "default_job_timeout")]
    pub job_timeout: Duration,

    /// A running job held longer than this is assumed lost and requeued.
    #[serde(with = "humantime_serde", default = "default_liveness_threshold")]
    pub liveness_threshold: Duration,

    #[serde(default = "default_job_kinds")]
    pub kinds: Vec<JobKind>,

    /// Tag → folder moves. An empty list turns auto-organization off.
    #[serde(default = "default_auto_organize")]
    pub auto_organize: Vec<OrganizeRule>,
}

/// Move files carrying `tag` into a sibling folder named `folder`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizeRule {
    pub tag: String,
    pub folder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewsConfig {
    #[serde(with = "humantime_serde", default = "default_web_fetch_timeout")]
    pub web_fetch_timeout: Duration,

    /// Lifetime of cached converted/fetched bytes.
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    pub cache_ttl: Duration,

    #[serde(default = "default_cache_entries")]
    pub cache_entries: usize,

    #[serde(default = "default_conversions")]
    pub conversions: Vec<ConversionRule>,

    /// Extensions included in `.context` bundles.
    #[serde(default = "default_context_extensions")]
    pub context_extensions: Vec<String>,

    #[serde(default = "default_context_max_bytes")]
    pub context_max_bytes: usize,

    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,

    /// Remote feeds exposed under `/.magic/api` in licensed mode.
    #[serde(default)]
    pub api_feeds: Vec<ApiFeed>,
}

/// Reading `name.<to>` when only `name.<from>` is stored converts on the fly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRule {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiFeed {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_license_key_env")]
    pub key_env: String,

    #[serde(with = "humantime_serde", default = "default_license_timeout")]
    pub timeout: Duration,
}

fn default_true() -> bool {
    true
}

fn default_source() -> PathBuf {
    PathBuf::from(".")
}

fn default_write_settle() -> Duration {
    Duration::from_millis(500)
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_nfs_port() -> u16 {
    11111
}

fn default_owner() -> u32 {
    1000
}

fn default_vault_root() -> String {
    "/vault".to_string()
}

fn default_vault_secret_env() -> String {
    "EIDETIC_VAULT_SECRET".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_workers() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_job_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_auto_organize() -> Vec<OrganizeRule> {
    vec![OrganizeRule {
        tag: "invoice".to_string(),
        folder: "Finance".to_string(),
    }]
}

fn default_liveness_threshold() -> Duration {
    Duration::from_secs(300)
}

fn default_job_kinds() -> Vec<JobKind> {
    JobKind::ALL.to_vec()
}

fn default_web_fetch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(2)
}

fn default_cache_entries() -> usize {
    64
}

fn default_conversions() -> Vec<ConversionRule> {
    vec![
        ConversionRule {
            from: "png".to_string(),
            to: "jpg".to_string(),
        },
        ConversionRule {
            from: "png".to_string(),
            to: "jpeg".to_string(),
        },
    ]
}

fn default_context_extensions() -> Vec<String> {
    [
        "rs", "toml", "md", "txt", "js", "ts", "jsx", "tsx", "json", "py", "c", "h", "cpp", "hpp", "go",
        "java", "kt", "swift", "html", "css", "scss", "sql", "sh", "yaml", "yml",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

fn default_context_max_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_recent_limit() -> usize {
    20
}

fn default_license_key_env() -> String {
    "EIDETIC_LICENSE_KEY".to_string()
}

fn default_license_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for NfsConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_nfs_port(),
            uid: default_owner(),
            gid: default_owner(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: default_vault_root(),
            secret_env: default_vault_secret_env(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
            job_timeout: default_job_timeout(),
            liveness_threshold: default_liveness_threshold(),
            kinds: default_job_kinds(),
            auto_organize: default_auto_organize(),
        }
    }
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            web_fetch_timeout: default_web_fetch_timeout(),
            cache_ttl: default_cache_ttl(),
            cache_entries: default_cache_entries(),
            conversions: default_conversions(),
            context_extensions: default_context_extensions(),
            context_max_bytes: default_context_max_bytes(),
            recent_limit: default_recent_limit(),
            api_feeds: Vec::new(),
        }
    }
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            key_env: default_license_key_env(),
            timeout: default_license_timeout(),
        }
    }
}

impl Default for MountSpec {
    fn default() -> Self {
        Self {
            source: default_source(),
            nfs: NfsConfig::default(),
            vault: VaultConfig::default(),
            analysis: AnalysisConfig::default(),
            views: ViewsConfig::default(),
            license: LicenseConfig::default(),
            mirror_writes: true,
            durable_commits: true,
            write_settle: default_write_settle(),
        }
    }
}

impl MountSpec {
    /// Spec rooted at `source` with every other setting defaulted.
    pub fn for_source(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }
}

impl Default for MountConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "default".to_string(),
                labels: None,
            },
            spec: MountSpec::default(),
        }
    }
}

impl MountConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Places a config file is looked for, in precedence order:
    /// `EIDETIC_CONFIG_PATH`, `./eidetic.yaml`, `~/.eidetic/config.yaml`.
    pub fn config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::with_capacity(3);
        if let Ok(path) = std::env::var("EIDETIC_CONFIG_PATH") {
            candidates.push(PathBuf::from(path));
        }
        candidates.push(PathBuf::from("./eidetic.yaml"));
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".eidetic").join("config.yaml"));
        }
        candidates
    }

    /// First existing entry of [`Self::config_candidates`].
    pub fn discover_config() -> Option<PathBuf> {
        Self::config_candidates().into_iter().find(|path| path.exists())
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::debug!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Variables read by [`Self::apply_env_overrides`].
    pub const ENV_OVERRIDES: [&'static str; 4] = [
        "EIDETIC_SOURCE",
        "EIDETIC_NFS_PORT",
        "EIDETIC_ANALYSIS_WORKERS",
        "EIDETIC_MIRROR_WRITES",
    ];

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("EIDETIC_SOURCE") {
            tracing::info!("Environment override: EIDETIC_SOURCE={}", val);
            self.spec.source = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("EIDETIC_NFS_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Environment override: EIDETIC_NFS_PORT={}", port);
                    self.spec.nfs.port = port;
                }
                Err(_) => {
                    tracing::warn!("Invalid value for EIDETIC_NFS_PORT: '{}'. Ignoring.", val);
                }
            }
        }

        if let Ok(val) = std::env::var("EIDETIC_ANALYSIS_WORKERS") {
            match val.parse::<usize>() {
                Ok(workers) => {
                    tracing::info!("Environment override: EIDETIC_ANALYSIS_WORKERS={}", workers);
                    self.spec.analysis.workers = workers;
                }
                Err(_) => {
                    tracing::warn!("Invalid value for EIDETIC_ANALYSIS_WORKERS: '{}'. Ignoring.", val);
                }
            }
        }

        if let Ok(val) = std::env::var("EIDETIC_MIRROR_WRITES") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => self.spec.mirror_writes = true,
                "false" | "0" | "no" | "off" => self.spec.mirror_writes = false,
                _ => {
                    tracing::warn!(
                        "Invalid value for EIDETIC_MIRROR_WRITES: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        self.spec.validate()
    }
}

impl MountSpec {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.analysis.queue_capacity == 0 {
            anyhow::bail!("spec.analysis.queue_capacity must be at least 1");
        }
        if self.analysis.workers == 0 {
            anyhow::bail!("spec.analysis.workers must be at least 1");
        }
        if self.analysis.liveness_threshold.is_zero() {
            anyhow::bail!("spec.analysis.liveness_threshold must be greater than zero");
        }

        let vault_root = self.vault.root.trim_end_matches('/');
        if vault_root.is_empty() {
            anyhow::bail!("spec.vault.root cannot be the mount root");
        }
        if vault_root.split('/').any(|part| part == "..") {
            anyhow::bail!("spec.vault.root cannot contain '..'");
        }

        for rule in &self.views.conversions {
            if rule.from.eq_ignore_ascii_case(&rule.to) {
                anyhow::bail!("Conversion rule maps '{}' onto itself", rule.from);
            }
        }

        for rule in &self.analysis.auto_organize {
            if rule.tag.is_empty() {
                anyhow::bail!("Auto-organize rule tag cannot be empty");
            }
            if rule.folder.is_empty() || rule.folder.contains('/') || rule.folder == ".." {
                anyhow::bail!("Auto-organize folder must be a single name, got '{}'", rule.folder);
            }
        }

        for feed in &self.views.api_feeds {
            if feed.name.is_empty() || feed.name.contains('/') {
                anyhow::bail!("API feed name must be a single name, got '{}'", feed.name);
            }
            if !(feed.url.starts_with("http://") || feed.url.starts_with("https://")) {
                anyhow::bail!("API feed '{}' must use an http(s) URL", feed.name);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = MountConfigManifest::default();
        assert_eq!(manifest.api_version, "eidetic/v1");
        assert_eq!(manifest.kind, "MountConfig");
        assert_eq!(manifest.spec.vault.root, "/vault");
        assert_eq!(manifest.spec.analysis.kinds.len(), 3);
        assert_eq!(
            manifest.spec.analysis.auto_organize,
            vec![OrganizeRule {
                tag: "invoice".to_string(),
                folder: "Finance".to_string(),
            }]
        );
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_with_durations() {
        let yaml = r#"
apiVersion: eidetic/v1
kind: MountConfig
metadata:
  name: workstation
spec:
  source: /home/me/docs
  analysis:
    queue_capacity: 8
    workers: 1
    retry_backoff: 50ms
    job_timeout: 2s
    kinds: [extract_todos, classify]
    auto_organize:
      - tag: invoice
        folder: Finance
  views:
    web_fetch_timeout: 750ms
    api_feeds:
      - name: bitcoin.json
        url: https://api.coindesk.com/v1/bpi/currentprice.json
"#;
        let manifest = MountConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.metadata.name, "workstation");
        assert_eq!(manifest.spec.source, PathBuf::from("/home/me/docs"));
        assert_eq!(manifest.spec.analysis.queue_capacity, 8);
        assert_eq!(manifest.spec.analysis.retry_backoff, Duration::from_millis(50));
        assert_eq!(manifest.spec.analysis.job_timeout, Duration::from_secs(2));
        assert_eq!(
            manifest.spec.analysis.kinds,
            vec![JobKind::ExtractTodos, JobKind::Classify]
        );
        assert_eq!(manifest.spec.analysis.auto_organize[0].folder, "Finance");
        assert_eq!(manifest.spec.views.web_fetch_timeout, Duration::from_millis(750));
        // Unspecified sections fall back to defaults.
        assert_eq!(manifest.spec.nfs.port, 11111);
        assert!(manifest.spec.mirror_writes);
        assert_eq!(manifest.spec.write_settle, Duration::from_millis(500));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let manifest = MountConfigManifest::default();
        let yaml = serde_yaml::to_string(&manifest).unwrap();
        let parsed = MountConfigManifest::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.spec.views.conversions, manifest.spec.views.conversions);
        assert_eq!(parsed.spec.analysis.liveness_threshold, manifest.spec.analysis.liveness_threshold);
    }

    #[test]
    fn test_validation() {
        let mut manifest = MountConfigManifest::default();

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.spec.analysis.queue_capacity = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.analysis.queue_capacity = 4;

        manifest.spec.vault.root = "/".to_string();
        assert!(manifest.validate().is_err());
        manifest.spec.vault.root = "/vault".to_string();

        manifest.spec.analysis.liveness_threshold = Duration::ZERO;
        assert!(manifest.validate().is_err());
        manifest.spec.analysis.liveness_threshold = Duration::from_secs(60);

        manifest.spec.analysis.auto_organize.push(OrganizeRule {
            tag: "invoice".to_string(),
            folder: "a/b".to_string(),
        });
        assert!(manifest.validate().is_err());
        manifest.spec.analysis.auto_organize.clear();

        manifest.spec.views.conversions.push(ConversionRule {
            from: "png".to_string(),
            to: "PNG".to_string(),
        });
        assert!(manifest.validate().is_err());
    }
}
