//! Work-item extraction from a generator loop's raw adapter output (§4.5
//! step 7). Ported from the original's `executor.py::extract_work_items`,
//! which tries three patterns in order and stops at the first that
//! matches anything: a JSON array, a markdown list (`- **id**: content`),
//! and a numbered list (`1. [id] content`).
//!
//! The markdown- and numbered-list patterns use lookahead in the Python
//! original (`(?=\n-|\n\n|$)`) to find where one item's content ends without
//! consuming the next item's marker. `regex` has no lookahead, so both are
//! reimplemented here as a line scan: a line opens a new item when it matches
//! the marker shape, and every following line is folded into that item's
//! content until either a blank line or the next marker line appears.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Fields the original lifts onto named columns; everything else an item
/// carries collapses into `metadata` (mirrors `executor.py`'s `known_fields`).
const KNOWN_FIELDS: &[&str] =
    &["id", "content", "title", "priority", "category", "tags", "dependencies", "acceptance_criteria", "complexity"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedItem {
    pub id: Option<String>,
    pub content: String,
    pub title: Option<String>,
    pub priority: Option<i64>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
    pub metadata: serde_json::Map<String, Value>,
}

/// Runs the fallback chain and returns whatever the first matching pattern
/// found, or an empty vec if none did.
pub fn extract_work_items(output: &str) -> Vec<ExtractedItem> {
    let json_items = extract_json_array(output);
    if !json_items.is_empty() {
        return json_items;
    }

    let markdown_items = extract_markdown_list(output);
    if !markdown_items.is_empty() {
        return markdown_items;
    }

    extract_numbered_list(output)
}

/// Finds the first top-level JSON array in `output` via a string-literal-aware
/// bracket scan (more robust than the original's lazy `\[[\s\S]*?\]` regex,
/// which can truncate at a `]` inside a quoted string), then keeps only the
/// objects that carry both `id` and `content`.
fn extract_json_array(output: &str) -> Vec<ExtractedItem> {
    let Some(slice) = find_json_array_slice(output) else { return Vec::new() };
    let Ok(Value::Array(values)) = serde_json::from_str::<Value>(slice) else { return Vec::new() };

    values
        .into_iter()
        .filter_map(|v| {
            let Value::Object(obj) = v else { return None };
            if !obj.contains_key("id") || !obj.contains_key("content") {
                return None;
            }
            Some(item_from_json_object(obj))
        })
        .collect()
}

fn item_from_json_object(mut obj: serde_json::Map<String, Value>) -> ExtractedItem {
    let id = obj.remove("id").and_then(|v| v.as_str().map(String::from));
    let content = obj.remove("content").and_then(|v| v.as_str().map(String::from)).unwrap_or_default();
    let title = obj.remove("title").and_then(|v| v.as_str().map(String::from));
    let priority = obj.remove("priority").and_then(|v| v.as_i64());
    let category = obj.remove("category").and_then(|v| v.as_str().map(String::from));
    let tags = obj
        .remove("tags")
        .and_then(|v| v.as_array().map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect()))
        .unwrap_or_default();
    let dependencies = obj
        .remove("dependencies")
        .and_then(|v| v.as_array().map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect()))
        .unwrap_or_default();

    // Remaining known fields (acceptance_criteria, complexity) fold into
    // metadata along with anything the model invented.
    let metadata = obj;

    ExtractedItem { id, content, title, priority, category, tags, dependencies, metadata }
}

/// Scans for the first `[` that opens a JSON array and returns the balanced
/// slice through its matching `]`, tracking string-literal state so brackets
/// inside quoted strings don't throw off the depth count.
fn find_json_array_slice(output: &str) -> Option<&str> {
    let bytes = output.as_bytes();
    let start = output.find('[')?;

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&output[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

static MARKDOWN_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-\s+\*\*([A-Za-z0-9_-]+)\*\*:\s*(.*)$").unwrap());

fn extract_markdown_list(output: &str) -> Vec<ExtractedItem> {
    scan_marked_lines(output, &MARKDOWN_MARKER)
}

static NUMBERED_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+\.\s*\[([A-Za-z0-9_-]+)\]\s*(.*)$").unwrap());

fn extract_numbered_list(output: &str) -> Vec<ExtractedItem> {
    scan_marked_lines(output, &NUMBERED_MARKER)
}

/// Generic line-scan replacement for a Python `(?=\n<marker>|\n\n|$)`
/// lookahead: accumulate lines into the current item until a blank line or
/// the next marker line closes it.
fn scan_marked_lines(output: &str, marker: &Regex) -> Vec<ExtractedItem> {
    let mut items: Vec<ExtractedItem> = Vec::new();
    let mut current: Option<(String, Vec<String>)> = None;

    for line in output.lines() {
        if let Some(caps) = marker.captures(line) {
            if let Some((id, lines)) = current.take() {
                items.push(ExtractedItem { id: Some(id), content: lines.join("\n").trim().to_string(), ..Default::default() });
            }
            let id = caps.get(1).unwrap().as_str().to_string();
            let rest = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
            current = Some((id, vec![rest]));
            continue;
        }

        if line.trim().is_empty() {
            if let Some((id, lines)) = current.take() {
                items.push(ExtractedItem { id: Some(id), content: lines.join("\n").trim().to_string(), ..Default::default() });
            }
            continue;
        }

        if let Some((_, lines)) = current.as_mut() {
            lines.push(line.to_string());
        }
    }

    if let Some((id, lines)) = current.take() {
        items.push(ExtractedItem { id: Some(id), content: lines.join("\n").trim().to_string(), ..Default::default() });
    }

    items.into_iter().filter(|i| !i.content.is_empty()).collect()
}

/// Whether `field` is one the JSON path already lifts onto a named column —
/// exposed so callers building diagnostics can tell an unrecognized field
/// apart from a known one without duplicating the list.
pub fn is_known_field(field: &str) -> bool {
    KNOWN_FIELDS.contains(&field)
}
