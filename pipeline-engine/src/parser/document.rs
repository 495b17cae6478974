// Pipeline Document Parser
// Loads stages, variables, fragments and jobs from a GitLab-style YAML document

use crate::parser::error::{closest_match, ParseError, ParseErrorKind, ParseResult};
use crate::parser::models::*;

use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Top-level keys that never define a job
const RESERVED_KEYS: &[&str] = &[
    "stages",
    "variables",
    "default",
    "include",
    "workflow",
    "image",
    "services",
    "cache",
    "before_script",
    "after_script",
];

const MERGE_KEY: &str = "<<";

/// Pipeline document parser
pub struct DocumentParser;

impl DocumentParser {
    /// Parse a document from YAML text
    pub fn parse(content: &str) -> ParseResult<Document> {
        let key_lines = scan_top_level_keys(content)?;

        let root: Value =
            serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))?;

        let root = match root {
            Value::Mapping(mapping) => mapping,
            Value::Null => Mapping::new(),
            _ => {
                return Err(ParseError::new("pipeline document must be a mapping", 1, 1)
                    .with_source_context(content, 1))
            }
        };

        let builder = DocumentBuilder {
            source: content,
            key_lines,
        };
        builder.build(&root)
    }

    /// Parse a document from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> ParseResult<Document> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ParseError::unlocated(
                ParseErrorKind::IoError,
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;

        Self::parse(&content)
    }
}

struct DocumentBuilder<'a> {
    source: &'a str,
    key_lines: HashMap<String, usize>,
}

impl<'a> DocumentBuilder<'a> {
    fn build(&self, root: &Mapping) -> ParseResult<Document> {
        let stages = self.parse_stages(root.get("stages"))?;

        let variables = match root.get("variables") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(value) => parse_variable_map(value).map_err(|msg| {
                self.error(ParseErrorKind::InvalidSchema, msg, Some("variables"))
            })?,
        };

        let defaults = match root.get("default") {
            None | Some(Value::Null) => JobTemplate::default(),
            Some(value) => self.parse_template("default", value)?,
        };

        // Hidden keys are fragments, every other non-reserved mapping is a job
        let mut fragments = BTreeMap::new();
        let mut job_bodies: Vec<(String, JobTemplate)> = Vec::new();

        for (key, value) in root {
            let Some(name) = key.as_str() else {
                tracing::debug!("ignoring non-string top-level key {:?}", key);
                continue;
            };

            if RESERVED_KEYS.contains(&name) {
                continue;
            }

            if !value.is_mapping() {
                tracing::debug!(key = name, "ignoring top-level key that is not a mapping");
                continue;
            }

            let template = self.parse_template(name, value)?;
            if name.starts_with('.') {
                fragments.insert(
                    name.to_string(),
                    Fragment {
                        name: name.to_string(),
                        template,
                        line: self.line_of(name),
                    },
                );
            } else {
                job_bodies.push((name.to_string(), template));
            }
        }

        let mut resolver = ExtendsResolver::new(self, &fragments, &job_bodies);
        let mut jobs = Vec::with_capacity(job_bodies.len());

        for (name, _) in &job_bodies {
            let merged = resolver.resolve_job(name, &defaults)?;
            jobs.push(self.finish_job(name, merged, &stages)?);
        }

        Ok(Document {
            stages,
            variables,
            fragments,
            jobs,
        })
    }

    fn parse_stages(&self, value: Option<&Value>) -> ParseResult<Vec<Stage>> {
        let names: Vec<String> = match value {
            None | Some(Value::Null) => DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(),
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| {
                    scalar_to_string(item).filter(|s| !s.is_empty()).ok_or_else(|| {
                        self.error(
                            ParseErrorKind::InvalidSchema,
                            "stage names must be non-empty strings",
                            Some("stages"),
                        )
                    })
                })
                .collect::<ParseResult<_>>()?,
            Some(_) => {
                return Err(self.error(
                    ParseErrorKind::InvalidSchema,
                    "'stages' must be a list of stage names",
                    Some("stages"),
                ))
            }
        };

        let mut seen = HashSet::new();
        let mut stages = Vec::with_capacity(names.len());
        for (ordinal, name) in names.into_iter().enumerate() {
            if !seen.insert(name.clone()) {
                return Err(self.error(
                    ParseErrorKind::DuplicateStage,
                    format!("stage '{}' is declared more than once", name),
                    Some("stages"),
                ));
            }
            stages.push(Stage { name, ordinal });
        }

        Ok(stages)
    }

    /// Deserialize a mapping into a template, folding in its `<<` merges
    fn parse_template(&self, owner: &str, value: &Value) -> ParseResult<JobTemplate> {
        let Value::Mapping(mapping) = value else {
            return Err(self.error(
                ParseErrorKind::InvalidSchema,
                format!("'{}' must be a mapping", owner),
                Some(owner),
            ));
        };

        let mut local = mapping.clone();
        let merges = local.remove(MERGE_KEY);

        let template: JobTemplate = serde_yaml::from_value(Value::Mapping(local)).map_err(|e| {
            let message = e.to_string();
            let kind = if message.contains("unknown retry cause") || message.contains("invalid duration") {
                ParseErrorKind::InvalidValue
            } else {
                ParseErrorKind::InvalidSchema
            };
            self.error(kind, format!("in '{}': {}", owner, message), Some(owner))
        })?;

        let merged_bases: Vec<JobTemplate> = match merges {
            None => Vec::new(),
            Some(Value::Mapping(base)) => vec![self.parse_template(owner, &Value::Mapping(base))?],
            Some(Value::Sequence(bases)) => bases
                .iter()
                .map(|base| self.parse_template(owner, base))
                .collect::<ParseResult<_>>()?,
            Some(_) => {
                return Err(self.error(
                    ParseErrorKind::InvalidSchema,
                    format!("'<<' in '{}' must reference a mapping or a list of mappings", owner),
                    Some(owner),
                ))
            }
        };

        // Earlier entries of a `<<` list take precedence over later ones
        let base = merged_bases
            .iter()
            .rev()
            .fold(JobTemplate::default(), |acc, next| acc.merged_with(next));

        if merged_bases.is_empty() {
            Ok(template)
        } else {
            // Keep inheritance markers for the `extends` / `default:` pass
            let mut merged = base.merged_with(&template);
            // A merged mapping's own `extends` applies unless the owner names its own
            merged.extends = template
                .extends
                .or_else(|| merged_bases.iter().find_map(|b| b.extends.clone()));
            merged.append = template.append;
            Ok(merged)
        }
    }

    fn finish_job(&self, name: &str, merged: JobTemplate, stages: &[Stage]) -> ParseResult<JobDefinition> {
        let stage = merged
            .stage
            .clone()
            .unwrap_or_else(|| DEFAULT_JOB_STAGE.to_string());

        if !stages.iter().any(|s| s.name == stage) {
            let mut error = self.error(
                ParseErrorKind::UnknownStage,
                format!("job '{}' references unknown stage '{}'", name, stage),
                Some(name),
            );
            if let Some(candidate) = closest_match(&stage, stages.iter().map(|s| s.name.as_str())) {
                error = error.with_suggestion(format!("did you mean '{}'?", candidate));
            } else {
                error = error.with_suggestion("add the stage to the top-level 'stages' list");
            }
            return Err(error);
        }

        let script = merged.script.unwrap_or_default();
        if script.is_empty() {
            return Err(self
                .error(
                    ParseErrorKind::InvalidSchema,
                    format!("job '{}' has no script", name),
                    Some(name),
                )
                .with_suggestion("add 'script:' with at least one command"));
        }

        let mut tags = Vec::new();
        for tag in merged.tags.unwrap_or_default() {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        Ok(JobDefinition {
            name: name.to_string(),
            stage,
            image: merged.image,
            before_script: merged.before_script.unwrap_or_default(),
            script,
            retry: merged.retry.unwrap_or_default(),
            interruptible: merged.interruptible.unwrap_or(false),
            tags,
            allow_failure: merged.allow_failure.unwrap_or_default(),
            timeout: merged.timeout,
            variables: merged.variables.unwrap_or_default(),
            line: self.line_of(name),
        })
    }

    fn line_of(&self, key: &str) -> Option<usize> {
        self.key_lines.get(key).copied()
    }

    fn error(&self, kind: ParseErrorKind, message: impl Into<String>, key: Option<&str>) -> ParseError {
        let line = key.and_then(|k| self.line_of(k));
        ParseError::unlocated(kind, message)
            .at_line(line)
            .with_source_context(self.source, 1)
    }
}

/// Resolves `extends` chains with memoisation and cycle detection
struct ExtendsResolver<'a, 'b> {
    builder: &'b DocumentBuilder<'a>,
    templates: HashMap<&'b str, &'b JobTemplate>,
    resolved: HashMap<String, JobTemplate>,
}

impl<'a, 'b> ExtendsResolver<'a, 'b> {
    fn new(
        builder: &'b DocumentBuilder<'a>,
        fragments: &'b BTreeMap<String, Fragment>,
        jobs: &'b [(String, JobTemplate)],
    ) -> Self {
        let mut templates: HashMap<&str, &JobTemplate> = fragments
            .iter()
            .map(|(name, fragment)| (name.as_str(), &fragment.template))
            .collect();
        // Jobs may extend other jobs as well as hidden fragments
        templates.extend(jobs.iter().map(|(name, t)| (name.as_str(), t)));

        Self {
            builder,
            templates,
            resolved: HashMap::new(),
        }
    }

    /// Resolve a job's full inheritance chain on top of `defaults`
    fn resolve_job(&mut self, name: &str, defaults: &JobTemplate) -> ParseResult<JobTemplate> {
        let mut stack = Vec::new();
        self.merge_chain(name, defaults.clone(), &mut stack)
    }

    fn resolve_inner(&mut self, name: &str, stack: &mut Vec<String>) -> ParseResult<JobTemplate> {
        if let Some(done) = self.resolved.get(name) {
            return Ok(done.clone());
        }

        if let Some(pos) = stack.iter().position(|n| n == name) {
            let mut cycle: Vec<&str> = stack[pos..].iter().map(String::as_str).collect();
            cycle.push(name);
            return Err(self.builder.error(
                ParseErrorKind::CyclicFragment,
                format!("cyclic fragment reference: {}", cycle.join(" -> ")),
                Some(&stack[pos]),
            ));
        }

        let merged = self.merge_chain(name, JobTemplate::default(), stack)?;
        self.resolved.insert(name.to_string(), merged.clone());
        Ok(merged)
    }

    fn merge_chain(
        &mut self,
        name: &str,
        base: JobTemplate,
        stack: &mut Vec<String>,
    ) -> ParseResult<JobTemplate> {
        let Some(own) = self.templates.get(name).copied() else {
            let referrer = stack.last().map(String::as_str).unwrap_or(name);
            let mut error = self.builder.error(
                ParseErrorKind::UnknownFragment,
                format!("'{}' extends unknown fragment '{}'", referrer, name),
                Some(referrer),
            );
            if let Some(candidate) = closest_match(name, self.templates.keys().copied()) {
                error = error.with_suggestion(format!("did you mean '{}'?", candidate));
            }
            return Err(error);
        };

        stack.push(name.to_string());
        let mut acc = base;
        for parent in own.extends.clone().unwrap_or_default() {
            let parent_template = self.resolve_inner(&parent, stack)?;
            acc = acc.merged_with(&parent_template);
        }
        stack.pop();

        Ok(acc.merged_with(own))
    }
}

/// Record the line of every top-level key and reject duplicate job names.
///
/// serde_yaml refuses duplicate keys with a generic message; scanning first
/// lets us report which job is duplicated and where.
fn scan_top_level_keys(source: &str) -> ParseResult<HashMap<String, usize>> {
    let mut lines = HashMap::new();

    for (idx, line) in source.lines().enumerate() {
        let line_num = idx + 1;
        let first = match line.chars().next() {
            Some(c) => c,
            None => continue,
        };
        if first.is_whitespace() || first == '#' || first == '-' || line.starts_with("---") {
            continue;
        }

        let Some(key) = top_level_key(line) else {
            continue;
        };

        if let Some(previous) = lines.insert(key.clone(), line_num) {
            let kind = if key.starts_with('.') || RESERVED_KEYS.contains(&key.as_str()) {
                ParseErrorKind::InvalidSchema
            } else {
                ParseErrorKind::DuplicateJob
            };
            return Err(ParseError::new(
                format!(
                    "'{}' is defined more than once (first definition on line {})",
                    key, previous
                ),
                line_num,
                1,
            )
            .with_kind(kind)
            .with_source_context(source, 1));
        }
    }

    Ok(lines)
}

fn top_level_key(line: &str) -> Option<String> {
    let (raw, quoted) = if let Some(rest) = line.strip_prefix('"') {
        (rest.split_once('"')?.0, true)
    } else if let Some(rest) = line.strip_prefix('\'') {
        (rest.split_once('\'')?.0, true)
    } else {
        (line.split_once(':')?.0, false)
    };

    let key = raw.trim();
    if key.is_empty() || (!quoted && (key.starts_with('{') || key.starts_with('['))) {
        return None;
    }
    Some(key.to_string())
}
