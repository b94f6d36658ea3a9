//! Resolve stage (spec §4.5.1): turn a declarative [`crate::model::DistributionConfig`]
//! into a concrete, arch-checked component list plus a kernel `.config`
//! artifact, failing fast before any bytes are downloaded or compiled.

use super::{ProgressFn, Stage};
use crate::context::StageContext;
use crate::error::BuildError;
use crate::kernelconfig::KernelConfigService;
use crate::model::distribution::ConfigMode;
use crate::model::{Component, ResolvedComponent, StageName};
use anyhow::{Context, Result};
use std::collections::BTreeMap;

pub struct ResolveStage;

struct ComponentRequest {
    name: String,
    version: Option<String>,
}

impl ComponentRequest {
    fn new(name: impl Into<String>, version: Option<String>) -> Self {
        ComponentRequest {
            name: name.into(),
            version,
        }
    }
}

/// Every component the distribution's config implies, independent of
/// whether it is actually catalogued (spec §4.5.1 step 2: kernel and
/// toolchain are always required; the rest are conditional on the
/// declared config).
fn required_component_requests(ctx: &StageContext) -> Vec<ComponentRequest> {
    let config = &ctx.config;
    let mut requests = vec![
        ComponentRequest::new("linux", Some(config.core.kernel.version.clone())),
        ComponentRequest::new(config.core.bootloader.clone(), config.core.bootloader_version.clone()),
        ComponentRequest::new(config.system.init.clone(), config.system.init_version.clone()),
    ];

    if config.system.filesystem_userspace {
        requests.push(ComponentRequest::new(
            config.system.filesystem.kind.clone(),
            config.system.filesystem_version.clone(),
        ));
    }

    if let Some(virtualization) = &config.runtime.virtualization {
        requests.push(ComponentRequest::new(
            virtualization.clone(),
            config.runtime.virtualization_version.clone(),
        ));
    }
    if let Some(container) = &config.runtime.container {
        requests.push(ComponentRequest::new(
            container.clone(),
            config.runtime.container_version.clone(),
        ));
    }

    if config.security.system_userspace {
        requests.push(ComponentRequest::new(
            config.security.system.clone(),
            config.security.system_version.clone(),
        ));
    }

    if let crate::model::distribution::TargetType::Desktop = config.target.kind {
        if let Some(desktop) = &config.target.desktop {
            requests.push(ComponentRequest::new(
                desktop.environment.clone(),
                desktop.environment_version.clone(),
            ));
            requests.push(ComponentRequest::new(
                desktop.display_server.clone(),
                desktop.display_server_version.clone(),
            ));
        }
    }

    let toolchain_name = match config.core.toolchain {
        crate::model::distribution::Toolchain::Gcc => format!("gcc-{}", ctx.target_arch.as_str()),
        crate::model::distribution::Toolchain::Llvm => format!("llvm-{}", ctx.target_arch.as_str()),
    };
    requests.push(ComponentRequest::new(toolchain_name, None));

    requests
}

/// Resolve a request to a completed artifact path: a finished download job
/// first, then a direct storage probe via the source registry (spec §4.5.1
/// step 4).
fn find_artifact(ctx: &StageContext, component: &Component, version: &str) -> Result<Option<String>> {
    if let Some(job) = ctx
        .services
        .download_jobs
        .find_completed(&component.id, version)
        .context("checking for a completed download job")?
    {
        if let Some(path) = job.artifact_path {
            return Ok(Some(path));
        }
    }

    if let Some(source_id) = ctx
        .services
        .sources
        .find_source_id(&component.id)
        .context("probing the source registry")?
    {
        let prefix = format!(
            "distribution/{}/{}/sources/{}/{}/",
            ctx.owner_id, ctx.distribution_id, source_id, version
        );
        let listed = ctx
            .services
            .object_store
            .list(&prefix)
            .context("listing object store for a fallback artifact")?;
        if let Some(first) = listed.into_iter().next() {
            return Ok(Some(first.key));
        }
    }

    Ok(None)
}

/// Resolves one requested component. Returns `Ok(None)` (after an info log)
/// when the component's `supported_architectures` is non-empty and omits
/// the target arch — such a component is dropped, never fatal (spec
/// §4.5.1 step 3, invariant spec.md:506-507). The board-profile arch
/// mismatch check is the only fatal arch check in this stage.
fn resolve_one(ctx: &StageContext, request: ComponentRequest) -> Result<Option<ResolvedComponent>> {
    let component = ctx
        .services
        .components
        .find_by_name(&request.name)
        .context("looking up component in the catalog")?
        .ok_or_else(|| BuildError::ArtifactMissing(format!("component not found: {}", request.name)))?;

    if !component.supports(ctx.target_arch) {
        ctx.log_info(
            StageName::Resolve,
            format!(
                "dropping component '{}': does not support target arch {}",
                component.name,
                ctx.target_arch.as_str()
            ),
        );
        return Ok(None);
    }

    let version = request.version.unwrap_or_else(|| component.default_version.clone());
    let artifact_path = find_artifact(ctx, &component, &version)?
        .ok_or_else(|| BuildError::ArtifactMissing(format!("no ready artifact for {}@{}", component.name, version)))?;

    Ok(Some(ResolvedComponent {
        component,
        version,
        artifact_path: Some(artifact_path),
        local_path: None,
    }))
}

fn has_virtualization_or_container(ctx: &StageContext) -> (bool, bool) {
    (
        ctx.config.runtime.virtualization.is_some(),
        ctx.config.runtime.container.is_some(),
    )
}

/// Produce or fetch the kernel `.config` artifact for this distribution
/// (spec §4.5.1 step 5, and the synthesis rules of spec §4.6).
fn fetch_or_synthesize_kernel_config(ctx: &StageContext) -> Result<()> {
    let key = format!(
        "distribution/{}/{}/kernel/.config",
        ctx.owner_id, ctx.distribution_id
    );
    let local_dest = ctx.paths.config.join(".config");

    if ctx.services.object_store.exists(&key)? {
        if let Some(resolved) = ctx.services.object_store.resolve_local_path(&key) {
            if local_dest.exists() || local_dest.is_symlink() {
                std::fs::remove_file(&local_dest).ok();
            }
            std::os::unix::fs::symlink(&resolved, &local_dest)
                .context("symlinking existing kernel config artifact")?;
        } else {
            ctx.services.object_store.download(&key, &local_dest)?;
        }
        return Ok(());
    }

    let (has_virt, has_container) = has_virtualization_or_container(ctx);
    let content = match ctx.config.core.kernel.config_mode {
        ConfigMode::Defconfig => KernelConfigService::generate(
            ConfigMode::Defconfig,
            ctx.target_arch.as_str(),
            &ctx.config.system.filesystem.kind,
            &ctx.config.system.init,
            &ctx.config.security.system,
            has_virt,
            has_container,
            &BTreeMap::new(),
        )?,
        ConfigMode::Options => KernelConfigService::generate(
            ConfigMode::Options,
            ctx.target_arch.as_str(),
            &ctx.config.system.filesystem.kind,
            &ctx.config.system.init,
            &ctx.config.security.system,
            has_virt,
            has_container,
            &ctx.config.core.kernel.config_options,
        )?,
        ConfigMode::Custom => {
            let custom_key = ctx
                .config
                .core
                .kernel
                .custom_config_path
                .as_deref()
                .ok_or_else(|| BuildError::ConfigInvalid("custom kernel config mode requires custom_config_path".into()))?;
            let tmp = ctx.paths.config.join(".config.custom-source");
            ctx.services.object_store.download(custom_key, &tmp)?;
            let raw = std::fs::read_to_string(&tmp).context("reading downloaded custom kernel config")?;
            std::fs::remove_file(&tmp).ok();
            KernelConfigService::generate_custom(&raw, ctx.target_arch.as_str())
        }
    };

    std::fs::create_dir_all(&ctx.paths.config)?;
    std::fs::write(&local_dest, &content).context("writing synthesized kernel config")?;
    crate::store::local::upload_bytes(
        ctx.services.object_store.as_ref(),
        &key,
        content.as_bytes(),
        "text/plain",
    )?;

    Ok(())
}

impl Stage for ResolveStage {
    fn name(&self) -> StageName {
        StageName::Resolve
    }

    fn validate(&self, ctx: &StageContext) -> Result<()> {
        if ctx.config.core.kernel.version.trim().is_empty() {
            return Err(BuildError::ConfigInvalid("kernel version must not be empty".into()).into());
        }
        Ok(())
    }

    fn execute(&self, ctx: &mut StageContext, progress: &mut ProgressFn) -> Result<()> {
        progress(0, "resolving board profile");
        if let Some(board_profile_id) = ctx.config.board_profile_id.clone() {
            let profile = ctx
                .services
                .board_profiles
                .get_by_id(&board_profile_id)
                .context("looking up board profile")?
                .ok_or_else(|| BuildError::ArtifactMissing(format!("board profile not found: {board_profile_id}")))?;
            if profile.arch != ctx.target_arch.as_str() {
                return Err(BuildError::UnsupportedArch {
                    host: profile.arch.clone(),
                    target: ctx.target_arch.as_str().to_string(),
                }
                .into());
            }
            ctx.board_profile = Some(profile);
        }

        progress(15, "resolving components");
        let requests = required_component_requests(ctx);
        let total = requests.len().max(1);
        let mut resolved = Vec::with_capacity(requests.len());
        for (i, request) in requests.into_iter().enumerate() {
            let name_for_log = request.name.clone();
            let pct = 15 + ((i + 1) * 55 / total) as u8;
            match resolve_one(ctx, request)? {
                Some(component) => {
                    ctx.log_info(StageName::Resolve, format!("resolved component '{name_for_log}' -> {}", component.version));
                    resolved.push(component);
                    progress(pct.min(70), &format!("resolved {name_for_log}"));
                }
                None => {
                    progress(pct.min(70), &format!("skipped {name_for_log} (unsupported arch)"));
                }
            }
        }
        ctx.components = resolved;

        progress(75, "synthesizing kernel config");
        fetch_or_synthesize_kernel_config(ctx)?;

        progress(90, "validating host toolchain");
        let has_toolchain_component = ctx
            .components
            .iter()
            .any(|c| c.component.category == "toolchain");
        if !ctx.executor.runtime_type().is_container_runtime() && !has_toolchain_component {
            crate::toolchain::validate_host_toolchain(&ctx.build_env)
                .context("host toolchain validation (direct/chroot executor)")?;
        }

        progress(100, "resolve complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Services, StagePaths};
    use crate::executor::chroot::ChrootExecutor;
    use crate::model::distribution::{
        CoreConfig, DistributionConfig, FilesystemConfig, KernelConfig, Partitioning,
        RuntimeConfig, SecurityConfig, SystemConfig, TargetConfig, TargetType,
    };
    use crate::model::{BuildEnvironment, Component, DownloadJob, ImageFormat, QemuSupport, TargetArch};
    use crate::repo::memory::{
        InMemoryBoardProfileRepository, InMemoryBuildJobRepository, InMemoryComponentRepository,
        InMemoryDownloadJobRepository, InMemorySourceRepository,
    };
    use crate::store::LocalObjectStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn base_config() -> DistributionConfig {
        DistributionConfig {
            board_profile_id: None,
            core: CoreConfig {
                kernel: KernelConfig {
                    version: "6.6".into(),
                    config_mode: ConfigMode::Defconfig,
                    config_options: BTreeMap::new(),
                    custom_config_path: None,
                },
                bootloader: "grub".into(),
                bootloader_version: None,
                toolchain: crate::model::distribution::Toolchain::Gcc,
                partitioning: Partitioning {
                    kind: "gpt".into(),
                    mode: "raw".into(),
                    size_gb: None,
                },
            },
            system: SystemConfig {
                init: "systemd".into(),
                init_version: None,
                filesystem: FilesystemConfig {
                    kind: "ext4".into(),
                    hierarchy: None,
                },
                filesystem_version: None,
                filesystem_userspace: false,
                package_manager: None,
                package_manager_version: None,
            },
            security: SecurityConfig {
                system: "none".into(),
                system_version: None,
                system_userspace: false,
            },
            runtime: RuntimeConfig {
                container: None,
                container_version: None,
                virtualization: None,
                virtualization_version: None,
            },
            target: TargetConfig {
                kind: TargetType::Server,
                desktop: None,
            },
        }
    }

    fn test_ctx(tmp: &TempDir, config: DistributionConfig) -> StageContext {
        let components = Arc::new(InMemoryComponentRepository::new());
        components.insert(Component {
            id: "c-linux".into(),
            name: "linux".into(),
            category: "kernel".into(),
            default_version: "6.6".into(),
            supported_architectures: vec![],
        });
        components.insert(Component {
            id: "c-grub".into(),
            name: "grub".into(),
            category: "bootloader".into(),
            default_version: "2.12".into(),
            supported_architectures: vec![],
        });
        components.insert(Component {
            id: "c-systemd".into(),
            name: "systemd".into(),
            category: "init".into(),
            default_version: "255".into(),
            supported_architectures: vec![],
        });
        components.insert(Component {
            id: "c-gcc".into(),
            name: "gcc-x86_64".into(),
            category: "toolchain".into(),
            default_version: "13".into(),
            supported_architectures: vec![],
        });

        let download_jobs = Arc::new(InMemoryDownloadJobRepository::new());
        for (id, version) in [
            ("c-linux", "6.6"),
            ("c-grub", "2.12"),
            ("c-systemd", "255"),
            ("c-gcc", "13"),
        ] {
            download_jobs.insert(DownloadJob {
                component_id: id.into(),
                component_ids: vec![],
                version: version.into(),
                status: "completed".into(),
                artifact_path: Some(format!("distribution/o/d/components/{id}/{version}/pkg.tar.gz")),
                error_message: None,
            });
        }

        let object_store = Arc::new(LocalObjectStore::new(tmp.path()));

        StageContext {
            build_id: "build-1".into(),
            distribution_id: "d".into(),
            owner_id: "o".into(),
            config,
            target_arch: TargetArch::X86_64,
            image_format: ImageFormat::Raw,
            paths: StagePaths::under(tmp.path().join("job")),
            job_repo: Arc::new(InMemoryBuildJobRepository::new()),
            services: Services {
                components,
                download_jobs,
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

    #[test]
    fn resolves_all_required_components_and_synthesizes_kernel_config() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = test_ctx(&tmp, base_config());
        ctx.paths.create_all().unwrap();

        let mut events = Vec::new();
        ResolveStage.execute(&mut ctx, &mut |p, m| events.push((p, m.to_string()))).unwrap();

        let names: Vec<&str> = ctx.components.iter().map(|c| c.component.name.as_str()).collect();
        assert!(names.contains(&"linux"));
        assert!(names.contains(&"grub"));
        assert!(names.contains(&"systemd"));
        assert!(names.contains(&"gcc-x86_64"));

        assert!(ctx.paths.config.join(".config").exists());
        let rendered = std::fs::read_to_string(ctx.paths.config.join(".config")).unwrap();
        assert!(rendered.contains("LDF_CONFIG_MODE=defconfig"));
    }

    #[test]
    fn missing_component_reports_artifact_missing() {
        let tmp = TempDir::new().unwrap();
        let mut config = base_config();
        config.core.bootloader = "nonexistent-bootloader".into();
        let mut ctx = test_ctx(&tmp, config);
        ctx.paths.create_all().unwrap();

        let result = ResolveStage.execute(&mut ctx, &mut |_, _| {});
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(crate::error::downcast(&err)
            .map(|e| matches!(e, BuildError::ArtifactMissing(_)))
            .unwrap_or(false));
    }

    #[test]
    fn validate_rejects_empty_kernel_version() {
        let tmp = TempDir::new().unwrap();
        let mut config = base_config();
        config.core.kernel.version = String::new();
        let ctx = test_ctx(&tmp, config);
        assert!(ResolveStage.validate(&ctx).is_err());
    }
}
