//! The vendor CAD boundary: environment configuration for the external
//! place-and-route tool, and the narrow capability interface the fuzzing
//! orchestration uses to obtain bitstreams and routing-graph facts.

mod backend;
mod toolchain;

pub use backend::{CadBackend, JobConfig, NodeInfo, PipInfo, ScriptBackend};
pub use toolchain::Toolchain;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
