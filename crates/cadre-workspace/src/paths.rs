use std::path::{Component, Path, PathBuf};

/// Normalize a caller-supplied relative path: clean `.` segments, reject
/// absolute paths and any `..` traversal. Directory names that merely start
/// with dots (`..x`) stay legal.
pub fn normalize_relative(raw: &str) -> Result<PathBuf, String> {
    if raw.trim().is_empty() {
        return Err("empty path".to_string());
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err("absolute paths are not allowed".to_string());
    }
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err("path traversal is not allowed".to_string()),
            Component::RootDir | Component::Prefix(_) => {
                return Err("absolute paths are not allowed".to_string())
            }
        }
    }
    if cleaned.as_os_str().is_empty() {
        return Err("empty path".to_string());
    }
    Ok(cleaned)
}

/// Containment via the relative-path check, never a string prefix:
/// `/root/work2` is not within `/root/work`, and a `..`-prefixed relative
/// result means escape.
pub fn path_within(root: &Path, candidate: &Path) -> bool {
    match candidate.strip_prefix(root) {
        Ok(rel) => !rel
            .components()
            .any(|c| matches!(c, Component::ParentDir)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_accepts_clean_nested_paths() {
        assert_eq!(
            normalize_relative("a/./b/c.txt").unwrap(),
            PathBuf::from("a/b/c.txt")
        );
        assert_eq!(normalize_relative("..x/file").unwrap(), PathBuf::from("..x/file"));
    }

    #[test]
    fn normalize_rejects_escape_attempts() {
        assert!(normalize_relative("../up").is_err());
        assert!(normalize_relative("a/../../up").is_err());
        assert!(normalize_relative("/abs").is_err());
        assert!(normalize_relative("").is_err());
    }

    #[test]
    fn containment_distinguishes_sibling_prefixes() {
        assert!(path_within(Path::new("/root/work"), Path::new("/root/work/sub")));
        assert!(!path_within(Path::new("/root/work"), Path::new("/root/work2")));
        assert!(!path_within(Path::new("/root/work"), Path::new("/elsewhere")));
    }
}
