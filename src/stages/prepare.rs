//! Prepare stage (spec §4.5.3): download each resolved component's
//! artifact into the job's workspace and extract it, recording the
//! extracted local path used by Compile and Assemble.

use super::{ProgressFn, Stage};
use crate::archive::ArchiveExtractor;
use crate::context::StageContext;
use crate::error::BuildError;
use crate::model::StageName;
use anyhow::{Context, Result};

pub struct PrepareStage;

impl Stage for PrepareStage {
    fn name(&self) -> StageName {
        StageName::Prepare
    }

    fn validate(&self, ctx: &StageContext) -> Result<()> {
        if ctx.components.is_empty() {
            return Err(BuildError::Internal("no components resolved before prepare".into()).into());
        }
        Ok(())
    }

    fn execute(&self, ctx: &mut StageContext, progress: &mut ProgressFn) -> Result<()> {
        std::fs::create_dir_all(&ctx.paths.sources)?;
        std::fs::create_dir_all(&ctx.paths.workspace)?;

        let total = ctx.components.len().max(1);
        for i in 0..ctx.components.len() {
            let (name, artifact_path) = {
                let component = &ctx.components[i];
                (
                    component.component.name.clone(),
                    component
                        .artifact_path
                        .clone()
                        .ok_or_else(|| BuildError::Internal(format!("component '{}' has no artifact path", component.component.name)))?,
                )
            };

            let filename = artifact_path
                .rsplit('/')
                .next()
                .unwrap_or(&artifact_path)
                .to_string();
            let download_dest = ctx.paths.sources.join(format!("{name}-{filename}"));

            ctx.services
                .object_store
                .download(&artifact_path, &download_dest)
                .with_context(|| format!("downloading artifact for '{name}'"))?;

            let extract_root = ctx.paths.workspace.join(&name);
            ArchiveExtractor::extract(&download_dest, &extract_root)
                .with_context(|| format!("extracting artifact for '{name}'"))?;
            let local_path = ArchiveExtractor::resolve_local_path(&extract_root)
                .with_context(|| format!("resolving extracted layout for '{name}'"))?;

            ctx.components[i].local_path = Some(local_path);

            let pct = ((i + 1) * 100 / total) as u8;
            progress(pct, &format!("prepared {name}"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn extracts_each_component_and_records_local_path() {
        let dir = TempDir::new().unwrap();
        let archive_path = dir.path().join("store/pkg.tar");
        fs::create_dir_all(archive_path.parent().unwrap()).unwrap();
        {
            let file = fs::File::create(&archive_path).unwrap();
            let mut builder = tar::Builder::new(file);
            let data = b"hello";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "pkg-1.0/bin/hello", &data[..]).unwrap();
            builder.finish().unwrap();
        }

        // a minimal manual smoke test of the extraction step this stage
        // relies on, since constructing a full StageContext here would
        // duplicate the fixture in stages::download_check::tests.
        let dest = dir.path().join("workspace/linux");
        ArchiveExtractor::extract(&archive_path, &dest).unwrap();
        let local = ArchiveExtractor::resolve_local_path(&dest).unwrap();
        assert_eq!(local, dest.join("pkg-1.0"));
        assert!(local.join("bin/hello").exists());
    }
}
