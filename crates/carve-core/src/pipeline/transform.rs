use crate::error::CoreError;
use crate::ir::Function;

/// A pass that rewrites one function in place.
///
/// Examples: constant folding, copy propagation, dead code elimination.
pub trait Transform {
    /// Name of this transform pass.
    fn name(&self) -> &str;

    /// Apply this transform, returning whether anything changed.
    fn apply(&self, func: &mut Function) -> Result<bool, CoreError>;
}

/// What a pipeline run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Full passes over the transform list.
    pub passes: usize,
    pub changed: bool,
    /// Stopped at the pass limit while still changing.
    pub hit_limit: bool,
}

/// An ordered sequence of transforms to apply.
pub struct TransformPipeline {
    transforms: Vec<Box<dyn Transform>>,
    fixpoint: bool,
    max_passes: usize,
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self {
            transforms: Vec::new(),
            fixpoint: false,
            max_passes: 16,
        }
    }

    pub fn add(&mut self, transform: Box<dyn Transform>) {
        self.transforms.push(transform);
    }

    pub fn set_fixpoint(&mut self, fixpoint: bool) {
        self.fixpoint = fixpoint;
    }

    pub fn set_max_passes(&mut self, max_passes: usize) {
        self.max_passes = max_passes.max(1);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.transforms.iter().map(|t| t.name())
    }

    /// Run all transforms in order, repeating while in fixpoint mode and
    /// something changed, up to the pass limit.
    pub fn run(&self, func: &mut Function) -> Result<PipelineReport, CoreError> {
        let mut report = PipelineReport::default();
        loop {
            let mut changed = false;
            for transform in &self.transforms {
                let did = transform.apply(func)?;
                if did {
                    tracing::trace!(pass = transform.name(), func = %func.name, "changed");
                }
                changed |= did;
            }
            report.passes += 1;
            func.stats.simplify_passes += 1;
            report.changed |= changed;
            if !self.fixpoint || !changed {
                break;
            }
            if report.passes >= self.max_passes {
                report.hit_limit = true;
                tracing::debug!(func = %func.name, passes = report.passes, "pipeline pass limit reached");
                break;
            }
        }
        Ok(report)
    }
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::new()
    }
}
