pub mod const_fold;
pub mod copy_prop;
pub mod dce;
pub mod util;

pub use const_fold::ConstantFolding;
pub use copy_prop::CopyPropagation;
pub use dce::{BranchFolding, DeadCodeElimination};

use crate::analysis::NonzeroMask;
use crate::pipeline::{PassConfig, TransformPipeline};

/// Build the reduced simplification pipeline run on jump-table clones.
pub fn reduced_pipeline(config: &PassConfig, max_passes: usize) -> TransformPipeline {
    let mut pipeline = TransformPipeline::new();
    if config.branch_folding {
        pipeline.add(Box::new(BranchFolding));
    }
    if config.nonzero_mask {
        pipeline.add(Box::new(NonzeroMask));
    }
    if config.constant_folding {
        pipeline.add(Box::new(ConstantFolding));
    }
    if config.copy_propagation {
        pipeline.add(Box::new(CopyPropagation));
    }
    if config.dead_code_elimination {
        pipeline.add(Box::new(DeadCodeElimination));
    }
    pipeline.set_fixpoint(config.fixpoint);
    pipeline.set_max_passes(max_passes);
    pipeline
}
