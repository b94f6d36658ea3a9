//! Download-check stage (spec §4.5.2): a fast barrier confirming every
//! artifact Resolve pointed at is actually present in the object store
//! before Prepare starts extracting anything. Resolve already proved a
//! download job or source probe existed; this stage re-verifies against
//! the object store itself, since time may have passed and retention
//! policies on the store are outside this engine's control.

use super::{ProgressFn, Stage};
use crate::context::StageContext;
use crate::error::BuildError;
use crate::model::StageName;
use anyhow::{Context, Result};

pub struct DownloadCheckStage;

impl Stage for DownloadCheckStage {
    fn name(&self) -> StageName {
        StageName::Download
    }

    fn validate(&self, ctx: &StageContext) -> Result<()> {
        if ctx.components.is_empty() {
            return Err(BuildError::Internal("no components resolved before download-check".into()).into());
        }
        Ok(())
    }

    fn execute(&self, ctx: &mut StageContext, progress: &mut ProgressFn) -> Result<()> {
        let total = ctx.components.len().max(1);
        let mut missing = Vec::new();

        for (i, component) in ctx.components.iter().enumerate() {
            let key = component
                .artifact_path
                .as_deref()
                .ok_or_else(|| BuildError::Internal(format!("component '{}' has no artifact path", component.component.name)))?;

            let present = ctx
                .services
                .object_store
                .exists(key)
                .with_context(|| format!("checking existence of '{key}'"))?;

            if !present {
                missing.push(component.component.name.clone());
            }

            let pct = ((i + 1) * 100 / total) as u8;
            progress(pct, &format!("checked {}", component.component.name));
        }

        if !missing.is_empty() {
            return Err(BuildError::ArtifactMissing(format!(
                "artifacts not yet present in storage: {}",
                missing.join(", ")
            ))
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Services, StagePaths};
    use crate::executor::chroot::ChrootExecutor;
    use crate::model::{
        BuildEnvironment, Component, DistributionConfig, ImageFormat, QemuSupport,
        ResolvedComponent, TargetArch,
    };
    use crate::repo::memory::{
        InMemoryBoardProfileRepository, InMemoryBuildJobRepository, InMemoryComponentRepository,
        InMemoryDownloadJobRepository, InMemorySourceRepository,
    };
    use crate::store::local::upload_bytes;
    use crate::store::LocalObjectStore;
    use serde_json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn minimal_config() -> DistributionConfig {
        serde_json::from_value(serde_json::json!({
            "board_profile_id": null,
            "core": {
                "kernel": {"version": "6.6", "config_mode": "defconfig", "config_options": {}, "custom_config_path": null},
                "bootloader": "grub",
                "bootloader_version": null,
                "toolchain": "gcc",
                "partitioning": {"type": "gpt", "mode": "raw", "size_gb": null}
            },
            "system": {
                "init": "systemd", "init_version": null,
                "filesystem": {"type": "ext4", "hierarchy": null},
                "filesystem_version": null, "filesystem_userspace": false,
                "package_manager": null, "package_manager_version": null
            },
            "security": {"system": "none", "system_version": null, "system_userspace": false},
            "runtime": {"container": null, "container_version": null, "virtualization": null, "virtualization_version": null},
            "target": {"type": "server", "desktop": null}
        }))
        .unwrap()
    }

    fn test_ctx(tmp: &TempDir) -> StageContext {
        let object_store = Arc::new(LocalObjectStore::new(tmp.path()));
        StageContext {
            build_id: "build-1".into(),
            distribution_id: "d".into(),
            owner_id: "o".into(),
            config: minimal_config(),
            target_arch: TargetArch::X86_64,
            image_format: ImageFormat::Raw,
            paths: StagePaths::under(tmp.path().join("job")),
            job_repo: Arc::new(InMemoryBuildJobRepository::new()),
            services: Services {
                components: Arc::new(InMemoryComponentRepository::new()),
                download_jobs: Arc::new(InMemoryDownloadJobRepository::new()),
                sources: Arc::new(InMemorySourceRepository::new()),
                board_profiles: Arc::new(InMemoryBoardProfileRepository::new()),
                object_store,
            },
            components: Vec::new(),
            board_profile: None,
            build_env: BuildEnvironment {
                host_arch: TargetArch::X86_64,
                target_arch: TargetArch::X86_64,
                is_native: true,
                toolchain: crate::model::env::Toolchain::default(),
                container_image: String::new(),
                container_platform_flag: String::new(),
                use_qemu_emulation: false,
                qemu_support: QemuSupport::default(),
            },
            executor: Box::new(ChrootExecutor::new()),
            artifact_path: None,
            artifact_checksum: None,
            artifact_size: None,
        }
    }

    fn component(name: &str, key: &str) -> ResolvedComponent {
        ResolvedComponent {
            component: Component {
                id: format!("c-{name}"),
                name: name.into(),
                category: "base".into(),
                default_version: "1.0".into(),
                supported_architectures: vec![],
            },
            version: "1.0".into(),
            artifact_path: Some(key.into()),
            local_path: None,
        }
    }

    #[test]
    fn passes_when_all_artifacts_present() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = test_ctx(&tmp);
        upload_bytes(ctx.services.object_store.as_ref(), "k1", b"x", "application/octet-stream").unwrap();
        ctx.components = vec![component("linux", "k1")];

        DownloadCheckStage.execute(&mut ctx, &mut |_, _| {}).unwrap();
    }

    #[test]
    fn reports_all_missing_artifacts_at_once() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = test_ctx(&tmp);
        ctx.components = vec![component("linux", "missing1"), component("grub", "missing2")];

        let result = DownloadCheckStage.execute(&mut ctx, &mut |_, _| {});
        assert!(result.is_err());
        let message = result.unwrap_err().to_string();
        assert!(message.contains("linux"));
        assert!(message.contains("grub"));
    }
}
