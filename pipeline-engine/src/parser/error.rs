// Document error types with helpful error messages
// Carries line/column info, a source excerpt and suggestions for common mistakes

use std::fmt;

/// A pipeline document that cannot be turned into a job model.
///
/// Loading fails with this error before any job is dispatched; the pipeline
/// never starts.
#[derive(Debug, Clone)]
pub struct ParseError {
    /// Error message
    pub message: String,
    /// Line number (1-indexed, 0 when unknown)
    pub line: usize,
    /// Column number (1-indexed, 0 when unknown)
    pub column: usize,
    /// Surrounding context (a few lines around the error)
    pub context: String,
    /// Optional suggestion for fixing the error
    pub suggestion: Option<String>,
    /// The kind of error
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// YAML syntax error
    YamlSyntax,
    /// Invalid schema (wrong types, missing script)
    InvalidSchema,
    /// Invalid value (unknown retry cause, bad timeout)
    InvalidValue,
    /// Job references a stage that is not declared
    UnknownStage,
    /// Stage declared more than once
    DuplicateStage,
    /// Job name declared more than once
    DuplicateJob,
    /// `extends` names a fragment that does not exist
    UnknownFragment,
    /// Fragments extend each other in a loop
    CyclicFragment,
    /// IO error (file not found, etc.)
    IoError,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            context: String::new(),
            suggestion: None,
            kind: ParseErrorKind::InvalidSchema,
        }
    }

    /// Error without a known source position
    pub fn unlocated(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self::new(message, 0, 0).with_kind(kind)
    }

    pub fn yaml_error(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self::new(message, line, column).with_kind(ParseErrorKind::YamlSyntax)
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_kind(mut self, kind: ParseErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Attach a source position (keeps an already known one)
    pub fn at_line(mut self, line: Option<usize>) -> Self {
        if self.line == 0 {
            if let Some(line) = line {
                self.line = line;
                self.column = 1;
            }
        }
        self
    }

    /// Create context from source content
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }

        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));

            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column.saturating_sub(1)) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }

        self.context = context;
        self
    }

    /// Create from serde_yaml error
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));

        let message = format_yaml_error_message(err);
        let suggestion = suggest_yaml_fix(source, line);

        let mut error = ParseError::yaml_error(message, line, column).with_source_context(source, 2);
        error.suggestion = suggestion;
        error
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        if self.line > 0 {
            writeln!(f, "  --> line {}:{}", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            writeln!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Format serde_yaml error message into something more readable
fn format_yaml_error_message(err: &serde_yaml::Error) -> String {
    let msg = err.to_string();

    if msg.contains("invalid type") {
        if let (Some(expected), Some(found)) = (
            extract_between(&msg, "expected ", ","),
            extract_between(&msg, "found ", " at"),
        ) {
            return format!("expected {}, but found {}", expected, found);
        }
    }

    // Location is rendered separately
    match msg.find(" at line ") {
        Some(idx) => msg[..idx].to_string(),
        None => msg,
    }
}

fn extract_between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

/// Suggest fixes for common YAML errors
fn suggest_yaml_fix(source: &str, line: usize) -> Option<String> {
    let error_line = source.lines().nth(line.saturating_sub(1)).unwrap_or("");

    if error_line.starts_with('\t') || error_line.trim_start_matches(' ').starts_with('\t') {
        return Some(
            "YAML prefers spaces over tabs for indentation. Replace tabs with spaces.".to_string(),
        );
    }

    if error_line.contains("*") && !error_line.contains("<<") && error_line.trim_end().ends_with(':') {
        return Some("aliases are merged into a job with '<<: *anchor'".to_string());
    }

    None
}

/// Result type for document operations
pub type ParseResult<T> = Result<T, ParseError>;

/// Suggest the closest known name for a typo (used for stage and fragment names)
pub(crate) fn closest_match<'a>(needle: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    candidates
        .into_iter()
        .map(|candidate| (edit_distance(needle, candidate), candidate))
        .filter(|(distance, candidate)| *distance <= 2.max(candidate.len() / 3))
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate)
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut current = vec![i + 1; b_chars.len() + 1];
        for (j, cb) in b_chars.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != *cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        previous = current;
    }

    previous[b_chars.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new("job 'build' references unknown stage 'biuld'", 10, 5)
            .with_context("   9 | build:\n> 10 |   stage: biuld\n")
            .with_suggestion("did you mean 'build'?");

        let output = format!("{}", err);
        assert!(output.contains("unknown stage"));
        assert!(output.contains("line 10:5"));
        assert!(output.contains("help:"));
    }

    #[test]
    fn test_unlocated_error_omits_position() {
        let err = ParseError::unlocated(ParseErrorKind::CyclicFragment, "cycle");
        let output = format!("{}", err);
        assert!(!output.contains("-->"));
        assert_eq!(err.kind, ParseErrorKind::CyclicFragment);
    }

    #[test]
    fn test_parse_error_with_source_context() {
        let source = "stages:\n  - audit\n\ncargo_audit:\n  stage: audti\n  script: [cargo audit]";

        let err = ParseError::new("unknown stage", 5, 3).with_source_context(source, 1);

        assert!(err.context.contains(">    5 |   stage: audti"));
        assert!(err.context.contains("cargo_audit:"));
    }

    #[test]
    fn test_from_yaml_error() {
        let source = "stages:\n  - build\nbuild: [unclosed";
        let yaml_err = serde_yaml::from_str::<serde_yaml::Value>(source).unwrap_err();
        let err = ParseError::from_yaml_error(&yaml_err, source);

        assert_eq!(err.kind, ParseErrorKind::YamlSyntax);
        assert!(err.line > 0);
    }

    #[test]
    fn test_closest_match() {
        let stages = ["audit", "build", "deploy"];
        assert_eq!(closest_match("biuld", stages), Some("build"));
        assert_eq!(closest_match("release", stages), None);
    }
}
