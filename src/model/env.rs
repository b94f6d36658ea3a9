//! The resolved architecture/toolchain/container bundle computed by the
//! [`crate::arch`] planner and carried on the [`crate::context::StageContext`].

#[derive(Debug, Clone, Default)]
pub struct Toolchain {
    pub cross_compile_prefix: String,
    pub make_arch: String,
    pub toolchain_pkg: String,
}

#[derive(Debug, Clone, Default)]
pub struct QemuSupport {
    pub available: bool,
    pub binfmt_registered: bool,
    pub binary_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BuildEnvironment {
    pub host_arch: crate::model::job::TargetArch,
    pub target_arch: crate::model::job::TargetArch,
    pub is_native: bool,
    pub toolchain: Toolchain,
    pub container_image: String,
    pub container_platform_flag: String,
    pub use_qemu_emulation: bool,
    pub qemu_support: QemuSupport,
}
