//! File utility functions

use std::path::PathBuf;

use directories::BaseDirs;

fn home_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|b| b.home_dir().to_path_buf())
}

/// Expand a path string to an absolute path.
///
/// Handles tilde expansion (`~`, `~/path`), relative paths (`.`, `..`,
/// `./path`, bare names), and passes absolute paths through unchanged.
pub fn expand_path(path: &str) -> PathBuf {
    let path = path.trim();

    if path.is_empty() {
        return std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    }

    let expanded = if path == "~" {
        home_dir().unwrap_or_else(|| PathBuf::from(path))
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            home.join(rest)
        } else {
            PathBuf::from(path)
        }
    } else {
        PathBuf::from(path)
    };

    if expanded.is_relative() {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    } else {
        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_absolute() {
        assert_eq!(expand_path("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_path_relative() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(expand_path("data"), cwd.join("data"));
        assert_eq!(expand_path("./data"), cwd.join("./data"));
    }

    #[test]
    fn test_expand_path_tilde() {
        let result = expand_path("~/data");
        assert!(result.is_absolute());
        assert!(result.ends_with("data"));
    }

    #[test]
    fn test_expand_path_empty() {
        assert_eq!(expand_path(""), std::env::current_dir().unwrap());
        assert_eq!(expand_path("   "), std::env::current_dir().unwrap());
    }
}
