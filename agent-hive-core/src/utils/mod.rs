//! Utility functions and helpers

use std::path::Path;

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> std::io::Result<std::path::PathBuf> {
    let path = path.as_ref();
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(path.to_path_buf())
}

/// Shorten an identifier for log lines, respecting UTF-8 boundaries
pub fn short_id(id: &str, max_len: usize) -> &str {
    if id.len() <= max_len {
        return id;
    }
    let mut end = max_len;
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    &id[..end]
}

/// Generate a fresh message or task identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
