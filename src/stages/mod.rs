//! The six-stage build pipeline (spec §4.5): Resolve, Download-check,
//! Prepare, Compile, Assemble, Package, run in this fixed order by one
//! `Worker` per job.

pub mod assemble;
pub mod compile;
pub mod download_check;
pub mod package;
pub mod prepare;
pub mod resolve;

use crate::context::StageContext;
use crate::model::StageName;
use anyhow::Result;

/// A progress callback a stage reports through: `(percent_within_stage,
/// milestone_message)`. The worker rescales this into the job's overall
/// `progress_percent` (spec §4.3).
pub type ProgressFn<'a> = dyn FnMut(u8, &str) + 'a;

/// One pipeline stage. `validate` is a fast, side-effect-free precondition
/// check the worker runs before committing the job's status to "running"
/// for that stage; `execute` does the actual work.
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;
    fn validate(&self, ctx: &StageContext) -> Result<()>;
    fn execute(&self, ctx: &mut StageContext, progress: &mut ProgressFn) -> Result<()>;
}

/// The fixed pipeline, in declared order (spec §4.5: never reordered).
pub fn pipeline() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(resolve::ResolveStage),
        Box::new(download_check::DownloadCheckStage),
        Box::new(prepare::PrepareStage),
        Box::new(compile::CompileStage),
        Box::new(assemble::AssembleStage),
        Box::new(package::PackageStage),
    ]
}
