//! Bijection between filesystem paths and the flat folder names the host
//! uses for per-session transcript directories.

/// `/Users/dev/project` -> `-Users-dev-project`. Trailing separators are
/// stripped first so `/a/b/` and `/a/b` encode identically.
pub fn encode_project_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    trimmed.replace('/', "-")
}

/// `-Users-dev-project` -> `/Users/dev/project`. Inverse of
/// `encode_project_path` on well-formed folder names.
pub fn decode_project_path(folder: &str) -> String {
    folder.replace('-', "/")
}
