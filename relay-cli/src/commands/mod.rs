pub mod run;
pub mod validate;

use std::collections::BTreeMap;
use std::path::Path;

use color_eyre::Result;

use pipeline_engine::{
    EngineConfig, GitSourceControl, RunIdentity, SourceControl, StaticSourceControl,
};

/// Parse repeated `--var NAME=VALUE` flags
pub fn parse_variables(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut variables = BTreeMap::new();
    for var_str in raw {
        match var_str.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                variables.insert(name.to_string(), value.to_string());
            }
            _ => color_eyre::eyre::bail!(
                "Invalid variable format '{}'. Expected name=value",
                var_str
            ),
        }
    }
    Ok(variables)
}

/// Load the engine configuration file if one was given
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Work out the run identity from flags, falling back to git
pub async fn identity(
    workspace: &Path,
    project: Option<String>,
    git_ref: Option<String>,
) -> Result<RunIdentity> {
    let project = project.unwrap_or_else(|| {
        workspace
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("project")
            .to_string()
    });

    let scm: Box<dyn SourceControl> = match git_ref {
        Some(git_ref) => Box::new(StaticSourceControl::new(git_ref, 0)),
        None if GitSourceControl::is_available() => Box::new(GitSourceControl::new(workspace)),
        None => Box::new(StaticSourceControl::new("main", 0)),
    };

    let git_ref = match scm.current_ref().await {
        Ok(git_ref) => git_ref,
        Err(e) => {
            tracing::warn!(error = %e, "could not read the current ref, using 'main'");
            "main".to_string()
        }
    };
    let depth = scm.commit_depth().await.unwrap_or_else(|e| {
        tracing::debug!(error = %e, "could not count commits");
        0
    });

    Ok(RunIdentity::new(project, git_ref)
        .with_commit_depth(depth)
        .with_project_dir(workspace))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variables() {
        let vars = parse_variables(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(vars.get("A").map(String::as_str), Some("1"));
        assert_eq!(vars.get("B").map(String::as_str), Some("x=y"));

        assert!(parse_variables(&["missing".to_string()]).is_err());
        assert!(parse_variables(&["=1".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_explicit_ref_skips_git() {
        let dir = std::env::temp_dir();
        let identity = identity(&dir, Some("relay".to_string()), Some("feature/x".to_string()))
            .await
            .unwrap();
        assert_eq!(identity.project, "relay");
        assert_eq!(identity.git_ref, "feature/x");
    }
}
