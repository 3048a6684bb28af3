//! Tool configuration.
//!
//! Loaded from `sprout.toml` next to the workspace root when present,
//! then overlaid with environment-derived settings. Everything has a
//! default; the file and every key in it are optional.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::workspace::constraints::Mirrors;
use crate::workspace::platform;

pub const CONFIG_FILE_NAME: &str = "sprout.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub prebuilts: PrebuiltsSection,
    #[serde(default)]
    pub mirrors: Mirrors,
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    /// Base URL of the package registry, if one is configured.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig { timeout_seconds: 60 }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PrebuiltsSection {
    /// Bypass prebuilt acquisition entirely.
    #[serde(default)]
    pub disabled: bool,
    /// Base URL for prebuilt manifests and archives.
    pub base_url: Option<String>,
    /// Toolchain version governing the manifest URL templates.
    pub swift_version: Option<String>,
    /// Artifact-variant key override for the host.
    pub host_platform: Option<String>,
    /// Directory of trusted root certificates (PEM).
    pub trust_dir: Option<PathBuf>,
    /// Override for the user-level cache directory.
    pub cache_dir: Option<PathBuf>,
}

impl WorkspaceConfig {
    /// Load from `<root>/sprout.toml` when present, then apply
    /// environment overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?
        } else {
            WorkspaceConfig::default()
        };
        config.apply_environment();
        Ok(config)
    }

    fn apply_environment(&mut self) {
        if let Ok(dir) = std::env::var("SPROUT_CACHE_DIR") {
            self.prebuilts.cache_dir = Some(PathBuf::from(dir));
        }
        if let Ok(version) = std::env::var("SPROUT_SWIFT_VERSION") {
            self.prebuilts.swift_version = Some(version);
        }
        if let Ok(platform) = std::env::var("SPROUT_HOST_PLATFORM") {
            self.prebuilts.host_platform = Some(platform);
        }
        if std::env::var("SPROUT_DISABLE_PREBUILTS").is_ok_and(|v| v != "0") {
            self.prebuilts.disabled = true;
        }
    }

    /// The effective user cache directory,
    /// `<user-cache>/org.swift.swiftpm` by default.
    pub fn user_cache_dir(&self) -> PathBuf {
        self.prebuilts.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join(crate::workspace::prebuilts::USER_CACHE_BUCKET)
        })
    }

    pub fn swift_version(&self) -> String {
        self.prebuilts
            .swift_version
            .clone()
            .unwrap_or_else(platform::default_swift_version)
    }
}
