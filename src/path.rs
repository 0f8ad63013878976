//! Share-relative path handling
//!
//! Paths handed to the client use `/` separators and are relative to the
//! root of a share. They are normalized to an absolute form (`/`, `/a/b`)
//! before use and converted to the backslash form the session expects only
//! at the session boundary.

/// Root of a share in normalized form
pub const ROOT: &str = "/";

/// Normalize a share path.
///
/// Accepts either separator, collapses repeated separators, resolves `.`
/// and `..` (never climbing above the root) and drops trailing separators.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for component in path.split(['/', '\\']) {
        match component {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            name => segments.push(name),
        }
    }

    if segments.is_empty() {
        ROOT.to_string()
    } else {
        let mut normalized = String::with_capacity(path.len() + 1);
        for segment in segments {
            normalized.push('/');
            normalized.push_str(segment);
        }
        normalized
    }
}

/// Resolve `relative` against the directory `base`.
///
/// A `relative` path that starts with a separator is anchored at the share
/// root instead.
pub fn join(base: &str, relative: &str) -> String {
    if relative.starts_with(['/', '\\']) {
        normalize(relative)
    } else {
        normalize(&format!("{}/{}", base, relative))
    }
}

/// Whether a normalized path names the share root
pub fn is_root(path: &str) -> bool {
    path == ROOT
}

/// Parent of a normalized path, `None` for the root
pub fn parent(path: &str) -> Option<String> {
    if is_root(path) {
        return None;
    }
    match path.rfind('/') {
        Some(0) | None => Some(ROOT.to_string()),
        Some(index) => Some(path[..index].to_string()),
    }
}

/// Last segment of a normalized path, empty for the root
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

/// Every prefix of a normalized path from the top down, the path included
///
/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`; the root yields nothing.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    prefixes
}

/// Convert a normalized path to the backslash form used on the wire
pub fn to_smb(path: &str) -> String {
    path.replace('/', "\\")
}
