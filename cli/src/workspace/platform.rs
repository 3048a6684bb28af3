//! Host platform and toolchain-version detection.

use serde::{Deserialize, Serialize};

/// The artifact-variant key for the running host. Values match the
/// platform keys used in prebuilt manifests.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostPlatform(String);

impl HostPlatform {
    pub const MACOS_UNIVERSAL: &'static str = "macos_universal";
    pub const MACOS_AARCH64: &'static str = "macos_aarch64";
    pub const UBUNTU_NOBLE_X86_64: &'static str = "ubuntu_noble_x86_64";
    pub const UBUNTU_NOBLE_AARCH64: &'static str = "ubuntu_noble_aarch64";

    pub fn new(key: impl Into<String>) -> Self {
        HostPlatform(key.into())
    }

    /// Detect from the build target, honoring an explicit override.
    pub fn detect(override_key: Option<&str>) -> Self {
        if let Some(key) = override_key {
            return HostPlatform(key.to_string());
        }
        #[cfg(target_os = "macos")]
        {
            HostPlatform(Self::MACOS_UNIVERSAL.to_string())
        }
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        {
            HostPlatform(Self::UBUNTU_NOBLE_X86_64.to_string())
        }
        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        {
            HostPlatform(Self::UBUNTU_NOBLE_AARCH64.to_string())
        }
        #[cfg(not(any(
            target_os = "macos",
            all(target_os = "linux", target_arch = "x86_64"),
            all(target_os = "linux", target_arch = "aarch64")
        )))]
        {
            HostPlatform("unknown".to_string())
        }
    }

    pub fn key(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The toolchain version that governs prebuilt manifest URL templates,
/// `major.minor` form (for example "6.1").
pub fn default_swift_version() -> String {
    "6.1".to_string()
}
