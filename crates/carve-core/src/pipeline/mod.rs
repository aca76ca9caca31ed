pub mod config;
pub mod transform;

pub use config::{AnalysisConfig, JumpTableConfig, PassConfig};
pub use transform::{PipelineReport, Transform, TransformPipeline};
