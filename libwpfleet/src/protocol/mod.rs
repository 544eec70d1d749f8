//! The line protocol spoken by the remote script.
//!
//! Any line of standard output that starts with `MARKER ` carries one
//! `key=value` pair. Everything else is ordinary log noise and is skipped.
//! Decoding never fails: a missing key is defaulted by whoever reads the map.

use std::collections::HashMap;

pub const MARKER_PREFIX: &str = "MARKER ";

pub const KEY_STATUS: &str = "status";
pub const KEY_FROM_VERSION: &str = "from_version";
pub const KEY_TO_VERSION: &str = "to_version";
pub const KEY_BACKUP_PATH: &str = "backup_path";
pub const KEY_HTTP_CODE: &str = "http_code";
pub const KEY_MAINTENANCE_CLEARED: &str = "maintenance_cleared";
pub const KEY_ERROR: &str = "error";

pub type Markers = HashMap<String, String>;

/// Decode every marker line in `output`. Later duplicates overwrite earlier
/// ones.
pub fn parse_markers(output: &str) -> Markers {
    let mut markers = Markers::new();
    for line in output.lines() {
        if let Some((key, value)) = parse_marker_line(line) {
            markers.insert(key.to_string(), value.to_string());
        }
    }
    markers
}

/// Decode a single line, returning the trimmed key and value when the line is
/// a marker. Only the first `=` separates key from value.
pub fn parse_marker_line(line: &str) -> Option<(&str, &str)> {
    let content = line.strip_prefix(MARKER_PREFIX)?.trim();
    let (key, value) = content.split_once('=')?;
    Some((key.trim(), value.trim()))
}

/// Render a marker line. Used by tests and fake remotes.
pub fn marker_line(key: &str, value: &str) -> String {
    format!("{MARKER_PREFIX}{key}={value}")
}
