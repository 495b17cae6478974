// Pipeline Document Models
// Types for stages, variables, fragments and job definitions

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Stages used when a document does not declare `stages`
pub const DEFAULT_STAGES: [&str; 3] = ["build", "test", "deploy"];

/// Stage a job lands in when it does not name one
pub const DEFAULT_JOB_STAGE: &str = "test";

/// Parsed pipeline document
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// Declared stages in execution order
    pub stages: Vec<Stage>,
    /// Global variable defaults
    pub variables: BTreeMap<String, String>,
    /// Named fragments (hidden `.name` keys)
    pub fragments: BTreeMap<String, Fragment>,
    /// Jobs in declaration order, fragments already merged in
    pub jobs: Vec<JobDefinition>,
}

impl Document {
    /// Look up a stage by name
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Look up a job by name
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Jobs of one stage, in declaration order
    pub fn jobs_in_stage<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a JobDefinition> + 'a {
        self.jobs.iter().filter(move |j| j.stage == stage)
    }
}

/// An ordered pipeline phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub name: String,
    /// Position in the `stages` list (0-based, strictly increasing)
    pub ordinal: usize,
}

/// A named, reusable partial job definition
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub name: String,
    /// The fragment's own keys, `<<` merges applied, `extends` not yet applied
    pub template: JobTemplate,
    /// Line of the fragment key in the document
    pub line: Option<usize>,
}

/// Sequence-valued keys that may opt into append semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendKey {
    BeforeScript,
    Script,
    Tags,
}

/// Partial job configuration as written in the document.
///
/// Every key is optional so that fragments, `default:` and job bodies share
/// one shape. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct JobTemplate {
    pub stage: Option<String>,

    #[serde(deserialize_with = "deserialize_image")]
    pub image: Option<String>,

    #[serde(deserialize_with = "deserialize_lines")]
    pub before_script: Option<Vec<String>>,

    #[serde(deserialize_with = "deserialize_lines")]
    pub script: Option<Vec<String>>,

    #[serde(deserialize_with = "deserialize_retry")]
    pub retry: Option<RetryPolicy>,

    pub interruptible: Option<bool>,

    #[serde(deserialize_with = "deserialize_lines")]
    pub tags: Option<Vec<String>>,

    pub allow_failure: Option<AllowFailure>,

    #[serde(deserialize_with = "deserialize_timeout")]
    pub timeout: Option<Duration>,

    #[serde(deserialize_with = "deserialize_variable_map")]
    pub variables: Option<BTreeMap<String, String>>,

    #[serde(deserialize_with = "deserialize_lines")]
    pub extends: Option<Vec<String>>,

    /// Sequence keys whose values are appended to the inherited ones
    pub append: Vec<AppendKey>,
}

/// Fully merged job definition (variables not yet layered or interpolated)
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinition {
    pub name: String,
    pub stage: String,
    pub image: Option<String>,
    pub before_script: Vec<String>,
    pub script: Vec<String>,
    pub retry: RetryPolicy,
    pub interruptible: bool,
    pub tags: Vec<String>,
    pub allow_failure: AllowFailure,
    pub timeout: Option<Duration>,
    pub variables: BTreeMap<String, String>,
    /// Line of the job key in the document
    pub line: Option<usize>,
}

// =============================================================================
// Retry policy
// =============================================================================

/// Why a job attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// Matches every other cause in a retry policy
    Always,
    UnknownFailure,
    ScriptFailure,
    ApiFailure,
    StuckOrTimeoutFailure,
    RunnerSystemFailure,
    JobExecutionTimeout,
}

impl FailureCause {
    pub const ALL: [FailureCause; 7] = [
        FailureCause::Always,
        FailureCause::UnknownFailure,
        FailureCause::ScriptFailure,
        FailureCause::ApiFailure,
        FailureCause::StuckOrTimeoutFailure,
        FailureCause::RunnerSystemFailure,
        FailureCause::JobExecutionTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::Always => "always",
            FailureCause::UnknownFailure => "unknown_failure",
            FailureCause::ScriptFailure => "script_failure",
            FailureCause::ApiFailure => "api_failure",
            FailureCause::StuckOrTimeoutFailure => "stuck_or_timeout_failure",
            FailureCause::RunnerSystemFailure => "runner_system_failure",
            FailureCause::JobExecutionTimeout => "job_execution_timeout",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureCause {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureCause::ALL
            .into_iter()
            .find(|cause| cause.as_str() == s)
            .ok_or_else(|| {
                let expected: Vec<&str> = FailureCause::ALL.iter().map(|c| c.as_str()).collect();
                format!(
                    "unknown retry cause '{}', expected one of: {}",
                    s,
                    expected.join(", ")
                )
            })
    }
}

/// How often and on which causes a job is retried
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max: u32,
    /// Causes that trigger a retry
    pub when: Vec<FailureCause>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            max: 0,
            when: vec![FailureCause::Always],
        }
    }

    pub fn new(max: u32, when: Vec<FailureCause>) -> Self {
        Self { max, when }
    }

    /// Whether the policy lists this cause
    pub fn covers(&self, cause: FailureCause) -> bool {
        self.when.contains(&FailureCause::Always) || self.when.contains(&cause)
    }

    /// Whether a failed attempt number `attempt` (1-based) gets another try
    pub fn should_retry(&self, attempt: u32, cause: FailureCause) -> bool {
        attempt <= self.max && self.covers(cause)
    }

    /// Upper bound on execution records for one job
    pub fn max_attempts(&self) -> u32 {
        self.max.saturating_add(1)
    }
}

// =============================================================================
// Allow failure
// =============================================================================

/// `allow_failure: true|false` or `allow_failure: { exit_codes: [..] }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowFailure {
    Flag(bool),
    ExitCodes { exit_codes: ExitCodes },
}

impl Default for AllowFailure {
    fn default() -> Self {
        AllowFailure::Flag(false)
    }
}

/// A single exit code or a list of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExitCodes {
    One(i32),
    Many(Vec<i32>),
}

impl AllowFailure {
    /// Whether a failure ending with `exit_code` is tolerated
    pub fn permits(&self, exit_code: Option<i32>) -> bool {
        match self {
            AllowFailure::Flag(flag) => *flag,
            AllowFailure::ExitCodes { exit_codes } => match (exit_codes, exit_code) {
                (ExitCodes::One(code), Some(actual)) => *code == actual,
                (ExitCodes::Many(codes), Some(actual)) => codes.contains(&actual),
                (_, None) => false,
            },
        }
    }

    /// Whether any failure could be tolerated
    pub fn is_enabled(&self) -> bool {
        !matches!(self, AllowFailure::Flag(false))
    }
}

// =============================================================================
// Custom deserializers
// =============================================================================

/// `image: rust:1.75` or `image: { name: rust:1.75, ... }`
fn deserialize_image<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Image {
        Name(String),
        Spec { name: String },
    }

    Ok(Option::<Image>::deserialize(deserializer)?.map(|image| match image {
        Image::Name(name) | Image::Spec { name } => name,
    }))
}

/// A single string or a list whose entries may be nested one level
fn deserialize_lines<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    let Some(value) = value else {
        return Ok(None);
    };

    let mut lines = Vec::new();
    collect_lines(&value, &mut lines, 0).map_err(de::Error::custom)?;
    Ok(Some(lines))
}

fn collect_lines(value: &serde_yaml::Value, out: &mut Vec<String>, depth: usize) -> Result<(), String> {
    match value {
        serde_yaml::Value::Sequence(items) if depth < 2 => {
            for item in items {
                collect_lines(item, out, depth + 1)?;
            }
            Ok(())
        }
        serde_yaml::Value::Null => Ok(()),
        other => match scalar_to_string(other) {
            Some(line) => {
                out.push(line);
                Ok(())
            }
            None => Err("expected a string or a list of strings".to_string()),
        },
    }
}

/// `retry: 2` or `retry: { max: 2, when: [runner_system_failure] }`
fn deserialize_retry<'de, D>(deserializer: D) -> Result<Option<RetryPolicy>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::Number(n)) => {
            let max = n
                .as_u64()
                .and_then(|max| u32::try_from(max).ok())
                .ok_or_else(|| de::Error::custom("retry count must be a non-negative integer"))?;
            Ok(Some(RetryPolicy::new(max, vec![FailureCause::Always])))
        }
        Some(serde_yaml::Value::Mapping(map)) => {
            let max = match map.get("max") {
                None => 0,
                Some(v) => v
                    .as_u64()
                    .and_then(|max| u32::try_from(max).ok())
                    .ok_or_else(|| de::Error::custom("retry.max must be a non-negative integer"))?,
            };

            let when = match map.get("when") {
                None | Some(serde_yaml::Value::Null) => vec![FailureCause::Always],
                Some(v) => {
                    let mut names = Vec::new();
                    collect_lines(v, &mut names, 0).map_err(de::Error::custom)?;
                    names
                        .iter()
                        .map(|name| name.parse::<FailureCause>())
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(de::Error::custom)?
                }
            };

            Ok(Some(RetryPolicy::new(max, when)))
        }
        Some(_) => Err(de::Error::custom(
            "retry must be a number or a mapping with 'max' and 'when'",
        )),
    }
}

/// `timeout: 3600`, `timeout: 1h 30m`, `timeout: 45 minutes`
fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::Number(n)) => n
            .as_u64()
            .map(|secs| Some(Duration::from_secs(secs)))
            .ok_or_else(|| de::Error::custom("timeout must be a positive number of seconds")),
        Some(serde_yaml::Value::String(s)) => parse_duration(&s).map(Some).map_err(de::Error::custom),
        Some(_) => Err(de::Error::custom("timeout must be a number or a duration string")),
    }
}

/// Parse a human duration such as `1h 30m`, `90s`, `2 hours`
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let invalid = || format!("invalid duration '{}'", input);
    let mut total = 0u64;
    let mut number = String::new();
    let mut unit = String::new();
    let mut seen_any = false;

    let mut flush = |number: &mut String, unit: &mut String| -> Result<(), String> {
        if number.is_empty() {
            return if unit.is_empty() { Ok(()) } else { Err(invalid()) };
        }
        let value: u64 = number.parse().map_err(|_| invalid())?;
        let factor = match unit.as_str() {
            "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
            "d" | "day" | "days" => 86_400,
            _ => return Err(invalid()),
        };
        total = value
            .checked_mul(factor)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
        number.clear();
        unit.clear();
        Ok(())
    };

    for ch in input.trim().chars() {
        if ch.is_ascii_digit() {
            if !unit.is_empty() {
                flush(&mut number, &mut unit)?;
            }
            number.push(ch);
            seen_any = true;
        } else if ch.is_alphabetic() {
            unit.push(ch.to_ascii_lowercase());
        } else if ch.is_whitespace() {
            continue;
        } else {
            return Err(invalid());
        }
    }
    flush(&mut number, &mut unit)?;

    if !seen_any || total == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

/// Variable values may be scalars or `{ value: ..., description: ... }`
fn deserialize_variable_map<'de, D>(deserializer: D) -> Result<Option<BTreeMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(value) => parse_variable_map(&value).map(Some).map_err(de::Error::custom),
    }
}

/// Parse a `variables:` mapping into name -> value
pub fn parse_variable_map(value: &serde_yaml::Value) -> Result<BTreeMap<String, String>, String> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| "variables must be a mapping of name to value".to_string())?;

    let mut variables = BTreeMap::new();
    for (key, raw) in mapping {
        let name = key
            .as_str()
            .ok_or_else(|| "variable names must be strings".to_string())?
            .to_string();

        let value = match raw {
            serde_yaml::Value::Mapping(spec) => spec
                .get("value")
                .and_then(scalar_to_string)
                .unwrap_or_default(),
            other => scalar_to_string(other)
                .ok_or_else(|| format!("variable '{}' must be a scalar value", name))?,
        };
        variables.insert(name, value);
    }

    Ok(variables)
}

/// Render a YAML scalar the way it is written
pub(crate) fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}
