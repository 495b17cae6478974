// Order resolution and variable layering

pub mod resolver;
pub mod variables;

pub use resolver::{Resolver, ResolvedJob, ResolvedPipeline, ResolvedStage, RunIdentity};
pub use variables::{UnresolvedVariableError, VariableSet, CACHE_DIR_VARIABLE};
