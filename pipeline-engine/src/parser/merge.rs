// Fragment Merging
// Shallow key-wise override of a job template by a more specific one

use crate::parser::models::{AppendKey, JobTemplate};

impl JobTemplate {
    /// Merge `local` on top of `self` and return the combined template.
    ///
    /// Keys set in `local` win. Sequence keys (`before_script`, `script`,
    /// `tags`) are replaced wholesale unless `local.append` names them, in
    /// which case the inherited entries come first. `retry` is replaced as a
    /// whole. `variables` are merged per name with `local` winning. Neither
    /// input is modified.
    pub fn merged_with(&self, local: &JobTemplate) -> JobTemplate {
        let appends = |key: AppendKey| local.append.contains(&key);

        JobTemplate {
            stage: local.stage.clone().or_else(|| self.stage.clone()),
            image: local.image.clone().or_else(|| self.image.clone()),
            before_script: merge_sequence(
                &self.before_script,
                &local.before_script,
                appends(AppendKey::BeforeScript),
            ),
            script: merge_sequence(&self.script, &local.script, appends(AppendKey::Script)),
            retry: local.retry.clone().or_else(|| self.retry.clone()),
            interruptible: local.interruptible.or(self.interruptible),
            tags: merge_sequence(&self.tags, &local.tags, appends(AppendKey::Tags)),
            allow_failure: local
                .allow_failure
                .clone()
                .or_else(|| self.allow_failure.clone()),
            timeout: local.timeout.or(self.timeout),
            variables: match (&self.variables, &local.variables) {
                (Some(base), Some(over)) => {
                    let mut merged = base.clone();
                    merged.extend(over.iter().map(|(k, v)| (k.clone(), v.clone())));
                    Some(merged)
                }
                (base, over) => over.clone().or_else(|| base.clone()),
            },
            // Inheritance links and append markers are consumed by the merge
            extends: None,
            append: Vec::new(),
        }
    }
}

fn merge_sequence(
    base: &Option<Vec<String>>,
    local: &Option<Vec<String>>,
    append: bool,
) -> Option<Vec<String>> {
    match (base, local) {
        (Some(base), Some(local)) if append => {
            let mut merged = base.clone();
            merged.extend(local.iter().cloned());
            Some(merged)
        }
        (base, local) => local.clone().or_else(|| base.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::{AllowFailure, FailureCause, RetryPolicy};

    fn template(yaml: &str) -> JobTemplate {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn rust_fragment() -> JobTemplate {
        template(
            r#"
image: rust:1.75
interruptible: true
tags: [docker]
before_script:
  - rustc --version
  - cargo --version
retry:
  max: 2
  when: [runner_system_failure]
variables:
  CARGO_HOME: /cache/cargo
  RUSTFLAGS: -Dwarnings
"#,
        )
    }

    #[test]
    fn test_local_scalars_win() {
        let job = template("image: rust:nightly\nallow_failure: true\nscript: [cargo audit]");
        let merged = rust_fragment().merged_with(&job);

        assert_eq!(merged.image.as_deref(), Some("rust:nightly"));
        assert_eq!(merged.interruptible, Some(true));
        assert_eq!(merged.allow_failure, Some(AllowFailure::Flag(true)));
        assert_eq!(merged.script, Some(vec!["cargo audit".to_string()]));
    }

    #[test]
    fn test_sequences_are_replaced_not_concatenated() {
        let job = template("before_script: [apt-get update]\ntags: [gpu]");
        let merged = rust_fragment().merged_with(&job);

        assert_eq!(merged.before_script, Some(vec!["apt-get update".to_string()]));
        assert_eq!(merged.tags, Some(vec!["gpu".to_string()]));
    }

    #[test]
    fn test_append_marker_concatenates() {
        let job = template("before_script: [apt-get update]\ntags: [gpu]\nappend: [tags]");
        let merged = rust_fragment().merged_with(&job);

        assert_eq!(merged.tags, Some(vec!["docker".to_string(), "gpu".to_string()]));
        assert_eq!(merged.before_script, Some(vec!["apt-get update".to_string()]));
        assert!(merged.append.is_empty());
    }

    #[test]
    fn test_retry_is_replaced_whole() {
        let job = template("retry: 1");
        let merged = rust_fragment().merged_with(&job);
        assert_eq!(merged.retry, Some(RetryPolicy::new(1, vec![FailureCause::Always])));
    }

    #[test]
    fn test_variables_merge_per_name() {
        let job = template("variables:\n  RUSTFLAGS: \"\"\n  EXTRA: yes");
        let merged = rust_fragment().merged_with(&job);
        let vars = merged.variables.unwrap();

        assert_eq!(vars["CARGO_HOME"], "/cache/cargo");
        assert_eq!(vars["RUSTFLAGS"], "");
        assert_eq!(vars["EXTRA"], "yes");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let fragment = rust_fragment();
        let job = template("stage: build\nscript: [cargo build --release]\ntags: [fast]");

        let once = fragment.merged_with(&job);
        let twice = fragment.merged_with(&fragment).merged_with(&job);
        let reapplied = fragment.merged_with(&fragment.merged_with(&job));

        assert_eq!(once, twice);
        assert_eq!(once, reapplied);
    }

    #[test]
    fn test_fragment_is_not_mutated() {
        let fragment = rust_fragment();
        let snapshot = fragment.clone();
        let _ = fragment.merged_with(&template("image: alpine\nappend: [tags]\ntags: [x]"));
        assert_eq!(fragment, snapshot);
    }
}
