use crate::error::{Error, Result};

/// Validate a file path within a branch tree.
///
/// Paths are flat keys: `"/cfg.json"` and `"cfg.json"` are different files
/// and no directory entries exist. A path must be non-empty, free of control
/// characters, and must not contain `.` or `..` segments.
///
/// # Errors
/// Returns [`Error::InvalidPath`] if the path violates any rule.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::invalid_path("path must not be empty"));
    }

    if let Some(ch) = path.chars().find(|c| c.is_control()) {
        return Err(Error::invalid_path(format!(
            "path contains control character {:?}: {:?}",
            ch, path,
        )));
    }

    for seg in path.split('/') {
        if seg == "." || seg == ".." {
            return Err(Error::invalid_path(format!(
                "path segment '{}' is not allowed: {:?}",
                seg, path,
            )));
        }
    }

    Ok(())
}

/// Validate a branch name.
///
/// Rejects slashes (names map to one directory on disk), spaces, tabs,
/// control characters, `..`, a leading `.` or `-`, and a `.lock` suffix.
///
/// # Errors
/// Returns [`Error::InvalidBranchName`] if the name violates any rule.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_branch_name("branch name must not be empty"));
    }

    for ch in name.chars() {
        match ch {
            '/' | '\\' | ':' | ' ' | '\t' | '~' | '^' | '?' | '*' | '[' => {
                return Err(Error::invalid_branch_name(format!(
                    "branch name contains invalid character: {:?}",
                    ch,
                )));
            }
            c if c.is_control() => {
                return Err(Error::invalid_branch_name(format!(
                    "branch name contains control character: {:?}",
                    c,
                )));
            }
            _ => {}
        }
    }

    if name.contains("..") {
        return Err(Error::invalid_branch_name(
            "branch name must not contain '..'",
        ));
    }

    if name.starts_with('.') || name.starts_with('-') {
        return Err(Error::invalid_branch_name(
            "branch name must not start with '.' or '-'",
        ));
    }

    if name.ends_with(".lock") {
        return Err(Error::invalid_branch_name(
            "branch name must not end with '.lock'",
        ));
    }

    Ok(())
}

/// Project ids share the branch-name rules: both become directory names.
pub fn validate_project_id(id: &str) -> Result<()> {
    validate_branch_name(id).map_err(|e| match e {
        Error::InvalidBranchName(msg) => {
            Error::invalid_argument(format!("invalid project id: {}", msg))
        }
        other => other,
    })
}

/// Plain prefix match, OR'd across `prefixes`. No prefixes matches everything.
pub fn matches_prefixes<S: AsRef<str>>(path: &str, prefixes: &[S]) -> bool {
    prefixes.is_empty() || prefixes.iter().any(|p| path.starts_with(p.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_ok() {
        assert!(validate_path("/cfg.json").is_ok());
        assert!(validate_path("a/b/c.txt").is_ok());
        assert!(validate_path("/a//b").is_ok());
    }

    #[test]
    fn path_rejects_empty_and_dots() {
        assert!(validate_path("").is_err());
        assert!(validate_path("/a/../b").is_err());
        assert!(validate_path("./a").is_err());
        assert!(validate_path("a\nb").is_err());
    }

    #[test]
    fn branch_name_rules() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("feature-1.2").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("a/b").is_err());
        assert!(validate_branch_name("a..b").is_err());
        assert!(validate_branch_name(".hidden").is_err());
        assert!(validate_branch_name("main.lock").is_err());
        assert!(validate_branch_name("has space").is_err());
    }

    #[test]
    fn project_id_error_kind() {
        assert!(matches!(
            validate_project_id("a/b"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn prefix_matching() {
        let none: [&str; 0] = [];
        assert!(matches_prefixes("/z/c.txt", &none));
        assert!(matches_prefixes("/a/b.txt", &["/a/"]));
        assert!(!matches_prefixes("/z/c.txt", &["/a/"]));
        assert!(matches_prefixes("/z/c.txt", &["/a/", "/z"]));
    }
}
