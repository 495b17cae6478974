// Variable Sets
// Layered name -> value maps and `$NAME` / `${NAME}` interpolation

use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Variable filled in by the executor once the cache lease exists
pub const CACHE_DIR_VARIABLE: &str = "CI_CACHE_DIR";

/// A referenced variable that no layer defines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedVariableError {
    /// Job whose variable set failed to resolve (None for pipeline-level values)
    pub job: Option<String>,
    /// Where the reference appears (a variable name or `image`)
    pub referrer: String,
    /// The name that could not be resolved
    pub missing: String,
    /// The reference is part of a cycle rather than undefined
    pub cyclic: bool,
}

impl UnresolvedVariableError {
    fn in_job(mut self, job: &str) -> Self {
        self.job = Some(job.to_string());
        self
    }
}

impl fmt::Display for UnresolvedVariableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(job) = &self.job {
            write!(f, "job '{}': ", job)?;
        }
        if self.cyclic {
            write!(
                f,
                "'{}' references '{}', which refers back to itself",
                self.referrer, self.missing
            )
        } else {
            write!(
                f,
                "'{}' references undefined variable '{}'",
                self.referrer, self.missing
            )
        }
    }
}

impl std::error::Error for UnresolvedVariableError {}

/// Layered variable set. Later layers shadow earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableSet {
    vars: BTreeMap<String, String>,
}

impl VariableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from layers ordered lowest precedence first
    pub fn layered<'a>(layers: impl IntoIterator<Item = &'a BTreeMap<String, String>>) -> Self {
        let mut vars = BTreeMap::new();
        for layer in layers {
            vars.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Environment map handed to an environment
    pub fn to_env(&self) -> HashMap<String, String> {
        self.vars.clone().into_iter().collect()
    }

    /// Expand every value against the set itself.
    ///
    /// Names listed in `deferred` are left as written so a later pass can
    /// fill them in.
    pub fn resolved(&self, deferred: &[&str]) -> Result<VariableSet, UnresolvedVariableError> {
        let mut expander = Expander::new(self, deferred);
        let mut vars = BTreeMap::new();
        for name in self.vars.keys() {
            vars.insert(name.clone(), expander.value_of(name, name)?);
        }
        Ok(VariableSet { vars })
    }

    /// Expand a free-standing string (such as an image name) against the set
    pub fn interpolate(
        &self,
        referrer: &str,
        input: &str,
        deferred: &[&str],
    ) -> Result<String, UnresolvedVariableError> {
        Expander::new(self, deferred).expand(referrer, input)
    }

    /// Attach the job name to a resolution error
    pub(crate) fn resolved_for_job(
        &self,
        job: &str,
        deferred: &[&str],
    ) -> Result<VariableSet, UnresolvedVariableError> {
        self.resolved(deferred).map_err(|e| e.in_job(job))
    }
}

impl FromIterator<(String, String)> for VariableSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

struct Expander<'a> {
    set: &'a VariableSet,
    deferred: &'a [&'a str],
    done: HashMap<String, String>,
    visiting: Vec<String>,
}

impl<'a> Expander<'a> {
    fn new(set: &'a VariableSet, deferred: &'a [&'a str]) -> Self {
        Self {
            set,
            deferred,
            done: HashMap::new(),
            visiting: Vec::new(),
        }
    }

    fn value_of(&mut self, referrer: &str, name: &str) -> Result<String, UnresolvedVariableError> {
        if let Some(value) = self.done.get(name) {
            return Ok(value.clone());
        }

        if self.visiting.iter().any(|v| v == name) {
            return Err(UnresolvedVariableError {
                job: None,
                referrer: referrer.to_string(),
                missing: name.to_string(),
                cyclic: true,
            });
        }

        let raw = match self.set.get(name) {
            Some(raw) => raw.to_string(),
            None => {
                return Err(UnresolvedVariableError {
                    job: None,
                    referrer: referrer.to_string(),
                    missing: name.to_string(),
                    cyclic: false,
                })
            }
        };

        self.visiting.push(name.to_string());
        let expanded = self.expand(name, &raw);
        self.visiting.pop();

        let expanded = expanded?;
        self.done.insert(name.to_string(), expanded.clone());
        Ok(expanded)
    }

    fn expand(&mut self, referrer: &str, input: &str) -> Result<String, UnresolvedVariableError> {
        let chars: Vec<char> = input.chars().collect();
        let mut out = String::with_capacity(input.len());
        let mut i = 0;

        while i < chars.len() {
            if chars[i] != '$' {
                out.push(chars[i]);
                i += 1;
                continue;
            }

            match chars.get(i + 1) {
                Some('$') => {
                    out.push('$');
                    i += 2;
                }
                Some('{') => {
                    let close = chars[i + 2..].iter().position(|c| *c == '}');
                    match close {
                        Some(len) if len > 0 => {
                            let name: String = chars[i + 2..i + 2 + len].iter().collect();
                            self.push_reference(referrer, &name, true, &mut out)?;
                            i += len + 3;
                        }
                        _ => {
                            out.push('$');
                            i += 1;
                        }
                    }
                }
                Some(c) if is_ident_start(*c) => {
                    let len = chars[i + 1..]
                        .iter()
                        .take_while(|c| is_ident_char(**c))
                        .count();
                    let name: String = chars[i + 1..i + 1 + len].iter().collect();
                    self.push_reference(referrer, &name, false, &mut out)?;
                    i += len + 1;
                }
                _ => {
                    out.push('$');
                    i += 1;
                }
            }
        }

        Ok(out)
    }

    fn push_reference(
        &mut self,
        referrer: &str,
        name: &str,
        braced: bool,
        out: &mut String,
    ) -> Result<(), UnresolvedVariableError> {
        if self.deferred.contains(&name) {
            if braced {
                out.push_str(&format!("${{{}}}", name));
            } else {
                out.push('$');
                out.push_str(name);
            }
            return Ok(());
        }

        let value = self.value_of(referrer, name)?;
        out.push_str(&value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_later_layers_shadow_earlier() {
        let global = layer(&[("A", "global"), ("B", "global")]);
        let job = layer(&[("B", "job")]);
        let set = VariableSet::layered([&global, &job]);

        assert_eq!(set.get("A"), Some("global"));
        assert_eq!(set.get("B"), Some("job"));
    }

    #[test]
    fn test_interpolates_both_forms_recursively() {
        let set = VariableSet::layered([&layer(&[
            ("PROJECT", "relay"),
            ("ROOT", "/cache/$PROJECT"),
            ("TARGET", "${ROOT}/target"),
        ])]);

        let resolved = set.resolved(&[]).unwrap();
        assert_eq!(resolved.get("TARGET"), Some("/cache/relay/target"));
    }

    #[test]
    fn test_dollar_escape_and_lone_dollars() {
        let set = VariableSet::layered([&layer(&[("PRICE", "$$5 and $ and ${} and $1")])]);
        let resolved = set.resolved(&[]).unwrap();
        assert_eq!(resolved.get("PRICE"), Some("$5 and $ and ${} and $1"));
    }

    #[test]
    fn test_undefined_reference_fails() {
        let set = VariableSet::layered([&layer(&[("TARGET", "/cache/$MISSING/x")])]);
        let err = set.resolved_for_job("build", &[]).unwrap_err();

        assert_eq!(err.job.as_deref(), Some("build"));
        assert_eq!(err.referrer, "TARGET");
        assert_eq!(err.missing, "MISSING");
        assert!(!err.cyclic);
        assert_eq!(
            err.to_string(),
            "job 'build': 'TARGET' references undefined variable 'MISSING'"
        );
    }

    #[test]
    fn test_cycle_fails() {
        let set = VariableSet::layered([&layer(&[("A", "$B"), ("B", "${A}")])]);
        let err = set.resolved(&[]).unwrap_err();
        assert!(err.cyclic);
    }

    #[test]
    fn test_deferred_names_are_kept_verbatim() {
        let mut raw = VariableSet::layered([&layer(&[
            ("CARGO_TARGET_DIR", "${CI_CACHE_DIR}/target"),
            ("SCCACHE_DIR", "$CI_CACHE_DIR/sccache"),
            ("ESCAPED", "$$CI_CACHE_DIR"),
        ])]);

        let checked = raw.resolved(&[CACHE_DIR_VARIABLE]).unwrap();
        assert_eq!(checked.get("CARGO_TARGET_DIR"), Some("${CI_CACHE_DIR}/target"));
        assert_eq!(checked.get("SCCACHE_DIR"), Some("$CI_CACHE_DIR/sccache"));

        raw.insert(CACHE_DIR_VARIABLE, "/var/cache/relay/p/main/build");
        let filled = raw.resolved(&[]).unwrap();
        assert_eq!(
            filled.get("CARGO_TARGET_DIR"),
            Some("/var/cache/relay/p/main/build/target")
        );
        assert_eq!(filled.get("ESCAPED"), Some("$CI_CACHE_DIR"));
    }

    #[test]
    fn test_interpolate_free_string() {
        let set = VariableSet::layered([&layer(&[("RUST_VERSION", "1.75")])]);
        assert_eq!(
            set.interpolate("image", "rust:${RUST_VERSION}-slim", &[]).unwrap(),
            "rust:1.75-slim"
        );
    }
}
