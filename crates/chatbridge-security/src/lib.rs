//! Executor allowlist and workdir containment checks.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use chatbridge_protocol::{BrokerError, BrokerResult, Job};

/// Validates executor names against the allowlist and workdirs against the
/// configured project roots. Containment is component-wise, so a root of
/// `/repo` never admits `/repo-evil`.
pub struct Policy {
    allowlist: HashSet<String>,
    roots: Vec<PathBuf>,
}

impl Policy {
    pub fn new(allowlist: &[String], roots: &[String]) -> Self {
        let allowlist = allowlist
            .iter()
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .collect();
        let roots = roots
            .iter()
            .filter(|root| !root.is_empty())
            .map(|root| clean_path(Path::new(root)))
            .collect();
        Self { allowlist, roots }
    }

    pub fn validate(&self, job: &Job) -> BrokerResult<()> {
        self.validate_executor(&job.executor)?;
        self.validate_workdir(&job.workdir)?;
        Ok(())
    }

    pub fn validate_executor(&self, name: &str) -> BrokerResult<()> {
        if !self.allowlist.contains(name) {
            return Err(BrokerError::Policy(format!(
                "executor \"{name}\" is not allowed"
            )));
        }
        Ok(())
    }

    pub fn validate_workdir(&self, workdir: &str) -> BrokerResult<()> {
        if workdir.is_empty() {
            return Err(BrokerError::Policy("workdir cannot be empty".to_owned()));
        }
        let workdir = clean_path(Path::new(workdir));
        if self
            .roots
            .iter()
            .any(|root| workdir == *root || workdir.starts_with(root))
        {
            return Ok(());
        }
        Err(BrokerError::Policy(format!(
            "workdir \"{}\" is outside allowed roots",
            workdir.display()
        )))
    }

    /// The first configured root; base for relative `/cd` and `/new` paths.
    pub fn primary_root(&self) -> Option<&Path> {
        self.roots.first().map(PathBuf::as_path)
    }
}

/// Lexical normalization: drops `.`, resolves `..` against preceding
/// components, and never consults the filesystem.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match cleaned.components().next_back() {
                Some(Component::Normal(_)) => {
                    cleaned.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => cleaned.push(Component::ParentDir),
            },
            other => cleaned.push(other),
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::{clean_path, Policy};
    use std::path::Path;

    fn policy() -> Policy {
        Policy::new(
            &["codex".to_owned(), "claude".to_owned()],
            &["/repo".to_owned()],
        )
    }

    #[test]
    fn validate_executor_rejects_unknown_names() {
        let policy = policy();
        assert!(policy.validate_executor("codex").is_ok());
        let error = policy.validate_executor("sh").expect_err("unknown executor");
        assert!(error.to_string().contains("not allowed"));
    }

    #[test]
    fn validate_workdir_accepts_root_and_children() {
        let policy = policy();
        assert!(policy.validate_workdir("/repo").is_ok());
        assert!(policy.validate_workdir("/repo/web").is_ok());
        assert!(policy.validate_workdir("/repo/web/../api").is_ok());
    }

    #[test]
    fn validate_workdir_rejects_prefix_string_attacks() {
        let policy = policy();
        let error = policy
            .validate_workdir("/repo-evil")
            .expect_err("sibling with shared prefix");
        assert!(error.to_string().contains("outside"));
    }

    #[test]
    fn validate_workdir_rejects_empty_and_outside_paths() {
        let policy = policy();
        assert!(policy.validate_workdir("").is_err());
        assert!(policy.validate_workdir("/etc").is_err());
        assert!(policy.validate_workdir("/repo/../etc").is_err());
    }

    #[test]
    fn primary_root_returns_the_first_configured_root() {
        let policy = Policy::new(
            &["codex".to_owned()],
            &["/repo".to_owned(), "/other".to_owned()],
        );
        assert_eq!(policy.primary_root(), Some(Path::new("/repo")));

        let empty = Policy::new(&["codex".to_owned()], &[]);
        assert_eq!(empty.primary_root(), None);
    }

    #[test]
    fn clean_path_normalizes_dot_segments() {
        assert_eq!(clean_path(Path::new("/a/./b/../c")), Path::new("/a/c"));
        assert_eq!(clean_path(Path::new("/a/../..")), Path::new("/"));
        assert_eq!(clean_path(Path::new("a/../..")), Path::new(".."));
        assert_eq!(clean_path(Path::new(".")), Path::new("."));
    }
}
