//! The declarative distribution description supplied by callers, and its
//! optional board-profile overlay.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStatus {
    Pending,
    Building,
    Ready,
    Failed,
}

/// Externally-owned input row: the engine reads `config` and writes
/// `status` back through [`crate::repo::DistributionRepository`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    pub id: String,
    pub owner_id: String,
    pub config: Option<DistributionConfig>,
    pub status: DistributionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigMode {
    Defconfig,
    Options,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toolchain {
    Gcc,
    Llvm,
}

impl Default for Toolchain {
    fn default() -> Self {
        Toolchain::Gcc
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    pub version: String,
    pub config_mode: ConfigMode,
    #[serde(default)]
    pub config_options: BTreeMap<String, String>,
    pub custom_config_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partitioning {
    #[serde(rename = "type")]
    pub kind: String,
    pub mode: String,
    /// Size of the `raw`/`qcow2` image in GB. Defaults to 4 (spec §9 Open
    /// Question: exposed once here rather than threaded through a factory
    /// function per job).
    #[serde(default)]
    pub size_gb: Option<u32>,
}

impl Partitioning {
    pub const DEFAULT_SIZE_GB: u32 = 4;

    pub fn size_gb(&self) -> u32 {
        self.size_gb.unwrap_or(Self::DEFAULT_SIZE_GB)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub kernel: KernelConfig,
    pub bootloader: String,
    pub bootloader_version: Option<String>,
    #[serde(default)]
    pub toolchain: Toolchain,
    pub partitioning: Partitioning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub hierarchy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub init: String,
    pub init_version: Option<String>,
    pub filesystem: FilesystemConfig,
    pub filesystem_version: Option<String>,
    #[serde(default)]
    pub filesystem_userspace: bool,
    pub package_manager: Option<String>,
    pub package_manager_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub system: String,
    pub system_version: Option<String>,
    #[serde(default)]
    pub system_userspace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub container: Option<String>,
    pub container_version: Option<String>,
    pub virtualization: Option<String>,
    pub virtualization_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesktopConfig {
    pub environment: String,
    pub environment_version: Option<String>,
    pub display_server: String,
    pub display_server_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Server,
    Desktop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub kind: TargetType,
    pub desktop: Option<DesktopConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    pub board_profile_id: Option<String>,
    pub core: CoreConfig,
    pub system: SystemConfig,
    pub security: SecurityConfig,
    pub runtime: RuntimeConfig,
    pub target: TargetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTreeOverlay {
    pub source: String,
    #[serde(default)]
    pub overlays: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootParams {
    pub config_txt: Option<String>,
    #[serde(default)]
    pub extra_files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareEntry {
    pub name: String,
    pub path: String,
    pub component_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardProfileConfig {
    #[serde(default)]
    pub device_trees: Vec<DeviceTreeOverlay>,
    #[serde(default)]
    pub boot_params: BootParams,
    #[serde(default)]
    pub kernel_overlay: BTreeMap<String, String>,
    #[serde(default)]
    pub firmware: Vec<FirmwareEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardProfile {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub arch: String,
    pub config: BoardProfileConfig,
}
