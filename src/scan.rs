//! Scan results, allowlist-format reports and the operations between them.

pub mod allowlist;
pub mod finding;
pub mod validate;
pub mod vulnerability;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use finding::ScanFindingsDocument;

/// Serialize as pretty JSON with 4-space indentation, the layout of committed allowlists.
pub fn to_indented_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value
        .serialize(&mut serializer)
        .context("Failed to serialize JSON")?;
    String::from_utf8(buffer).context("Serialized JSON is not valid UTF-8")
}

/// Write `value` as indented JSON.
pub fn write_json<T: Serialize + ?Sized, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, to_indented_json(value)?)
        .with_context(|| format!("Failed to write JSON file: {}", path.display()))
}

/// Read a raw ECR findings document.
pub fn read_findings<P: AsRef<Path>>(path: P) -> Result<ScanFindingsDocument> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scan findings: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse scan findings: {}", path.display()))
}
