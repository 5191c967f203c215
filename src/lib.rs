pub mod assembler;
pub mod definition;
pub mod error;
pub mod lockfile;
pub mod observability;
pub mod pipeline;
pub mod provenance;
pub mod reproducibility;
pub mod runner;
pub mod secrets;
pub mod security;
pub mod signing;
pub mod smoke;
pub mod staging;
pub mod templates;
pub mod toolchain;
pub mod validation;
pub mod workspace;

pub use definition::PipelineDefinition;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{PipelineExecutor, PipelineRun, RunOptions, RunState};
