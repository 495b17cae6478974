// Document model for pipeline definitions
// Parses YAML documents, merges fragments and validates stage references

pub mod document;
pub mod error;
pub mod merge;
pub mod models;

pub use document::DocumentParser;
pub use error::{ParseError, ParseErrorKind, ParseResult};
pub use models::*;
