//! Directory view over flat artifact paths.
//!
//! Artifacts store a `path` such as `/docs/2024/` and a `filename`. There are
//! no directory records; directories are derived from the distinct stored
//! paths.

use std::collections::BTreeSet;

use crate::error::{Result, StoreError};

/// Split `/a/b/c.txt` into (`/a/b/`, `c.txt`).
///
/// A trailing slash yields an empty filename and a bare name lands in `/`.
pub fn split_file_path(file_path: &str) -> (String, String) {
    let trimmed = file_path.trim();
    if trimmed.is_empty() {
        return ("/".to_string(), String::new());
    }
    let with_root = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };
    match with_root.rfind('/') {
        Some(idx) => (with_root[..=idx].to_string(), with_root[idx + 1..].to_string()),
        None => ("/".to_string(), with_root),
    }
}

/// Check that `path` is an absolute directory path: it starts and ends with
/// `/` and has no empty, `.` or `..` segments.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(StoreError::InvalidArgument("path is empty".into()));
    }
    if !path.starts_with('/') || !path.ends_with('/') {
        return Err(StoreError::InvalidArgument(format!(
            "path {:?} must start and end with '/'",
            path
        )));
    }
    if path.contains('\\') || path.chars().any(char::is_control) {
        return Err(StoreError::InvalidArgument(format!("path {:?} has invalid characters", path)));
    }
    if path.len() > 1 {
        for segment in path[1..path.len() - 1].split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StoreError::InvalidArgument(format!(
                    "path {:?} has an invalid segment",
                    path
                )));
            }
        }
    }
    Ok(())
}

pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty() {
        return Err(StoreError::InvalidArgument("filename is empty".into()));
    }
    if filename == "." || filename == ".." {
        return Err(StoreError::InvalidArgument(format!("invalid filename {:?}", filename)));
    }
    if filename.contains(['/', '\\']) || filename.chars().any(char::is_control) {
        return Err(StoreError::InvalidArgument(format!(
            "filename {:?} has invalid characters",
            filename
        )));
    }
    Ok(())
}

/// Names of the directories directly below `query`, sorted and distinct
pub fn child_directories<'a, I>(query: &str, paths: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut children = BTreeSet::new();
    for path in paths {
        let Some(rest) = path.strip_prefix(query) else {
            continue;
        };
        if let Some(segment) = rest.split('/').next().filter(|s| !s.is_empty()) {
            children.insert(segment.to_string());
        }
    }
    children.into_iter().collect()
}
