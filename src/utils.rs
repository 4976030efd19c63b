//! Utility functions for string handling, JSON lookup, durations and the
//! state directory.
//!
//! - String truncation for logs and for posted article bodies
//! - Recursive key search in embedded page JSON
//! - Human-readable durations for the control surface
//! - File system validation for the state directory

use serde_json::Value;
use std::error::Error;
use std::fs as stdfs;
use std::time::Duration;
use tokio::fs;
use tracing::{info, instrument};

/// Truncate a string for logging purposes.
///
/// Long strings are truncated to `max` bytes (backing off to a character
/// boundary) with an ellipsis and byte count indicator appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…(+{} bytes)", &s[..end], s.len() - end)
}

/// Cut `s` to at most `max` characters.
///
/// # Returns
///
/// The (possibly shortened) string and whether anything was cut.
pub fn truncate_chars(s: &str, max: usize) -> (String, bool) {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => (s[..byte_idx].to_string(), true),
        None => (s.to_string(), false),
    }
}

/// Find the first value stored under `key` anywhere in a JSON tree.
///
/// Objects are searched before their children, depth first, in document
/// order. Next.js pages move their data around between deploys; searching
/// by key survives that where a fixed path would not.
pub fn find_key<'a>(data: &'a Value, key: &str) -> Option<&'a Value> {
    match data {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                return Some(v);
            }
            map.values().find_map(|v| find_key(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}

/// Format a duration as `1h 2m 3s`, dropping leading zero units.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

/// Ensure a directory exists and is writable.
///
/// This function creates the directory if it doesn't exist, then performs
/// a write test by creating and immediately deleting a marker file.
///
/// # Errors
///
/// Returns an error if:
/// - The directory cannot be created
/// - The directory is not writable (permission denied, read-only filesystem, etc.)
#[instrument(level = "info", skip_all, fields(path = %path))]
pub async fn ensure_writable_dir(path: &str) -> Result<(), Box<dyn Error>> {
    fs::create_dir_all(path).await?;
    // Try a small sync write using std fs (simpler error surface)
    let marker_path = format!("{}/.__write_check__", path.trim_end_matches('/'));
    stdfs::File::create(&marker_path)?;
    let _ = stdfs::remove_file(&marker_path);
    info!("State directory is writable");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_for_log_short_string() {
        let s = "Hello, world!";
        assert_eq!(truncate_for_log(s, 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
    }

    #[test]
    fn test_truncate_for_log_respects_char_boundaries() {
        // Cyrillic letters are two bytes each.
        let s = "биткоин".repeat(10);
        let result = truncate_for_log(&s, 5);
        assert!(result.starts_with("би…"));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), ("hello".to_string(), false));
        assert_eq!(truncate_chars("hello", 5), ("hello".to_string(), false));
        assert_eq!(truncate_chars("hello", 3), ("hel".to_string(), true));
        assert_eq!(truncate_chars("привет", 2), ("пр".to_string(), true));
    }

    #[test]
    fn test_find_key_nested() {
        let data = json!({
            "props": {
                "pageProps": {
                    "state": {
                        "newsStore": { "_newsList": [ { "article_ID": 1 } ] }
                    }
                }
            }
        });
        let list = find_key(&data, "_newsList").unwrap();
        assert!(list.is_array());
        assert_eq!(find_key(&data, "article_ID"), Some(&json!(1)));
        assert_eq!(find_key(&data, "missing"), None);
    }

    #[test]
    fn test_find_key_prefers_shallow_match() {
        let data = json!({ "a": { "k": "deep" }, "k": "shallow" });
        assert_eq!(find_key(&data, "k"), Some(&json!("shallow")));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(7)), "7s");
        assert_eq!(format_duration(Duration::from_secs(1200)), "20m 0s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
    }

    #[tokio::test]
    async fn test_ensure_writable_dir_creates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("state/nested");
        ensure_writable_dir(nested.to_str().unwrap()).await.unwrap();
        assert!(nested.is_dir());
    }
}
