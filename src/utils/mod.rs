//! Utility functions and helpers

use std::collections::HashMap;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Full hex SHA-256 digest of the given content
pub fn digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Hex digest prefix of `len` characters
pub fn hash_content(content: &[u8], len: usize) -> String {
    let mut hash = digest(content);
    hash.truncate(len);
    hash
}

/// Path as a string with `/` separators
pub fn normalize_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

/// Get relative path from base to target
pub fn relative_path(from: &Path, to: &Path) -> Option<String> {
    pathdiff::diff_paths(to, from).map(|p| normalize_path(&p))
}

/// Length of a module key unless it collides with another
pub const MODULE_KEY_LEN: usize = 8;

/// Digest a module key is cut from, stable across machines for the same
/// project layout
///
/// Derived from the path relative to the project root rather than the
/// absolute path.
pub fn module_digest(root: &Path, path: &Path) -> String {
    let relative = relative_path(root, path).unwrap_or_else(|| normalize_path(path));
    digest(relative.as_bytes())
}

/// Shortest distinct prefixes of `digests`, starting at `MODULE_KEY_LEN`
///
/// Keys that collide grow four characters at a time until they are unique;
/// keys that do not collide keep the short form. The result only depends on
/// the set of digests.
pub fn unique_keys(digests: &[String]) -> Vec<String> {
    let mut lens: Vec<usize> = digests.iter().map(|d| MODULE_KEY_LEN.min(d.len())).collect();

    loop {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (digest, &len) in digests.iter().zip(&lens) {
            *counts.entry(&digest[..len]).or_default() += 1;
        }

        let mut grew = false;
        for (digest, len) in digests.iter().zip(lens.iter_mut()) {
            if counts[&digest[..*len]] > 1 && *len < digest.len() {
                *len = (*len + 4).min(digest.len());
                grew = true;
            }
        }

        if !grew {
            break;
        }
    }

    digests
        .iter()
        .zip(lens)
        .map(|(digest, len)| digest[..len].to_string())
        .collect()
}

/// Text carried by a panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Format bytes as human-readable size
pub fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format duration as human-readable string
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs_f64();

    if secs >= 60.0 {
        let mins = (secs / 60.0).floor() as u64;
        let remaining_secs = secs - (mins as f64 * 60.0);
        format!("{}m {:.2}s", mins, remaining_secs)
    } else if secs >= 1.0 {
        format!("{:.2}s", secs)
    } else {
        format!("{:.0}ms", secs * 1000.0)
    }
}
