//! Browser policy documents.
//!
//! Only the keys openpath owns are touched; everything else in an existing
//! policy document (search engines, homepage, extensions) is preserved.

use std::path::Path;

use op_common::fs::{read_optional, write_atomic};
use op_common::{EnforceError, Result};
use op_whitelist::Rules;
use serde_json::{Map, Value, json};
use tracing::warn;

/// Managed key inside Firefox's `policies` object.
pub const FIREFOX_KEY: &str = "WebsiteFilter";
/// Managed top-level key in a Chromium policy document.
pub const CHROMIUM_KEY: &str = "URLBlocklist";

/// Normalize a blocked path entry into a WebExtension-style match pattern.
///
/// `*/ads/*` → `*://*/ads/*`, `https://example.com/games` → `*://example.com/games*`,
/// bare `example.com` → `*://example.com/*`.
pub fn normalize_path_pattern(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let rest = ["*://", "http://", "https://"]
        .iter()
        .find_map(|scheme| trimmed.strip_prefix(scheme))
        .unwrap_or(trimmed);

    if rest.is_empty() || rest == "*" {
        return None;
    }

    let (host, path) = match rest.split_once('/') {
        Some((host, path)) => (host, Some(path)),
        None => (rest, None),
    };
    let host = if host.is_empty() { "*" } else { host };
    let host = host.to_lowercase();

    let pattern = match path {
        None => format!("*://{host}/*"),
        Some(path) => {
            let mut pattern = format!("*://{host}/{path}");
            if !pattern.ends_with('*') {
                pattern.push('*');
            }
            pattern
        }
    };
    Some(pattern)
}

/// Chromium's URLBlocklist uses `host/path` prefixes without scheme globs.
pub fn to_chromium_pattern(pattern: &str) -> String {
    let rest = pattern.strip_prefix("*://").unwrap_or(pattern);
    let rest = rest.strip_suffix('*').unwrap_or(rest);
    rest.strip_suffix('/').unwrap_or(rest).to_string()
}

/// Sorted, deduplicated block patterns for a policy.
pub fn block_patterns(rules: &Rules) -> Vec<String> {
    let mut patterns: Vec<String> = rules
        .sorted_blocked_paths()
        .into_iter()
        .filter_map(|p| {
            let normalized = normalize_path_pattern(p);
            if normalized.is_none() {
                warn!(entry = p, "Skipping unusable blocked path");
            }
            normalized
        })
        .chain(
            rules
                .sorted_blocked_subdomains()
                .into_iter()
                .map(|d| format!("*://{d}/*")),
        )
        .collect();
    patterns.sort_unstable();
    patterns.dedup();
    patterns
}

/// Firefox managed fragment: the value of `policies.WebsiteFilter.Block`.
pub fn render_firefox_fragment(patterns: &[String]) -> Value {
    json!({ "Block": patterns })
}

/// Chromium managed fragment: the value of `URLBlocklist`.
pub fn render_chromium_fragment(patterns: &[String]) -> Value {
    Value::Array(
        patterns
            .iter()
            .map(|p| Value::String(to_chromium_pattern(p)))
            .collect(),
    )
}

/// An unreadable document fails the merge rather than being overwritten.
fn load_document(path: &Path) -> Result<Map<String, Value>> {
    let Some(content) = read_optional(path).map_err(|e| EnforceError::write(path, e))? else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) | Err(_) => {
            warn!(path = %path.display(), "Policy document is not a JSON object, replacing it");
            Ok(Map::new())
        }
    }
}

fn write_document(path: &Path, doc: Map<String, Value>) -> Result<()> {
    let content = serde_json::to_string_pretty(&Value::Object(doc))?;
    write_atomic(path, content.as_bytes()).map_err(|e| EnforceError::write(path, e))
}

/// Merge `fragment` into `policies.WebsiteFilter.Block` (or clear it with `None`).
pub fn merge_firefox(path: &Path, fragment: Option<&Value>) -> Result<()> {
    let mut doc = load_document(path)?;
    let policies = doc
        .entry("policies")
        .or_insert_with(|| Value::Object(Map::new()));
    if !policies.is_object() {
        *policies = Value::Object(Map::new());
    }
    let Some(policies) = policies.as_object_mut() else {
        return Ok(());
    };

    match fragment.and_then(|f| f.get("Block")) {
        Some(block) if block.as_array().is_some_and(|a| !a.is_empty()) => {
            let filter = policies
                .entry(FIREFOX_KEY)
                .or_insert_with(|| Value::Object(Map::new()));
            if !filter.is_object() {
                *filter = Value::Object(Map::new());
            }
            if let Some(filter) = filter.as_object_mut() {
                filter.insert("Block".to_string(), block.clone());
            }
        }
        _ => {
            // Keep operator-defined exceptions; drop only our block list.
            let now_empty = match policies.get_mut(FIREFOX_KEY).and_then(Value::as_object_mut) {
                Some(filter) => {
                    filter.remove("Block");
                    filter.is_empty()
                }
                None => false,
            };
            if now_empty {
                policies.remove(FIREFOX_KEY);
            }
        }
    }

    write_document(path, doc)
}

/// Merge `fragment` into the top-level `URLBlocklist` (or clear it with `None`).
pub fn merge_chromium(path: &Path, fragment: Option<&Value>) -> Result<()> {
    let mut doc = load_document(path)?;
    match fragment {
        Some(list) if list.as_array().is_some_and(|a| !a.is_empty()) => {
            doc.insert(CHROMIUM_KEY.to_string(), list.clone());
        }
        _ => {
            doc.remove(CHROMIUM_KEY);
        }
    }
    write_document(path, doc)
}
