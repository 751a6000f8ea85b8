//! Configuration for the test suite.
//!
//! The configuration is loaded from a TOML file, which is passed as a command line
//! argument to the test suite. Every section and setting is optional.

use std::{collections::HashSet, env, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::features::KernelFeature;

/// Kernel features to consider unsupported, whatever the probe says.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default)]
    pub disabled: HashSet<KernelFeature>,
}

/// Adjustable settings of the harness.
#[derive(Debug, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Directory in which the per-program temporary directories are created,
    /// the system one if unset.
    #[serde(default)]
    pub tmpdir: Option<PathBuf>,
    /// Directory holding resource files, the directory of the executable if unset.
    #[serde(default)]
    pub resource_dir: Option<PathBuf>,
    /// Kernel page size, detected at startup if unset.
    #[serde(default)]
    pub kernel_page_size: Option<usize>,
    /// File system type mounted for programs requiring a fresh mount.
    #[serde(default = "default_mount_fs_type")]
    pub mount_fs_type: String,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        SettingsConfig {
            tmpdir: None,
            resource_dir: None,
            kernel_page_size: None,
            mount_fs_type: default_mount_fs_type(),
        }
    }
}

fn default_mount_fs_type() -> String {
    String::from("tmpfs")
}

/// Configuration for the test suite.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
}

impl Config {
    /// Directory to stage resource files from.
    pub fn resource_dir(&self) -> PathBuf {
        if let Some(dir) = &self.settings.resource_dir {
            return dir.clone();
        }

        env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
