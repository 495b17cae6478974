// Engine Errors
// Failures that stop a pipeline before any job is dispatched

use crate::parser::ParseError;
use crate::resolve::UnresolvedVariableError;

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed pipeline document\n{0}")]
    MalformedDocument(#[from] ParseError),

    #[error("unresolved variable: {0}")]
    UnresolvedVariable(#[from] UnresolvedVariableError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("source control: {0}")]
    SourceControl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
