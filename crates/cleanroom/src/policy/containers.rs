//! Extraction of the JSON `containers` array embedded in policy text.
//!
//! The policy document is Rego, not JSON. Exactly one construct inside it is
//! JSON-shaped:
//!
//! ```text
//! containers := [
//!   { ... },
//!   { ... }
//! ]
//! ```
//!
//! The opening line must read exactly `containers := [` and the array closes at
//! the first following line that reads exactly `]` (trailing whitespace is
//! ignored on both). Everything outside that span is opaque to this module.

use std::ops::Range;

use common::CleanroomError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Opening line of the containers block.
pub const CONTAINERS_MARKER: &str = "containers := [";
const CONTAINERS_CLOSE: &str = "]";
const ASSIGNMENT: &str = "containers := ";

/// Failures locating or parsing the containers block.
#[derive(Debug, Error)]
pub enum ContainersError {
    #[error("'{CONTAINERS_MARKER}' line not found in policy")]
    MarkerNotFound,
    #[error("containers block opened on line {0} is never closed by a ']' line")]
    Unterminated(usize),
    #[error("containers block is not a JSON array of objects: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("container {index} has no 'layers' list")]
    MissingLayers { index: usize },
}

impl From<ContainersError> for CleanroomError {
    fn from(e: ContainersError) -> Self {
        CleanroomError::PolicyMismatch(e.to_string())
    }
}

/// One entry of the containers array.
///
/// Field order is preserved so unrelated fields re-serialise unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyContainer(Map<String, Value>);

impl PolicyContainer {
    /// Image reference the entry was generated for.
    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    /// Layer digests, or `None` if the field is missing or malformed.
    pub fn layers(&self) -> Option<Vec<&str>> {
        self.0
            .get("layers")?
            .as_array()?
            .iter()
            .map(Value::as_str)
            .collect()
    }

    /// Replace the layer digests, keeping the field's position.
    pub fn set_layers(&mut self, layers: &[String]) {
        let value = Value::Array(layers.iter().cloned().map(Value::String).collect());
        match self.0.get_mut("layers") {
            Some(slot) => *slot = value,
            None => {
                self.0.insert("layers".into(), value);
            }
        }
    }
}

/// Located containers block.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainersSpan {
    /// Byte range from the start of the marker line through the closing `]`.
    pub span: Range<usize>,
    /// Parsed entries, in document order.
    pub containers: Vec<PolicyContainer>,
}

impl ContainersSpan {
    /// `text` with the block replaced by `containers`, 2-space indented.
    /// Bytes outside [`span`](Self::span) are carried over untouched.
    pub fn splice(
        &self,
        text: &str,
        containers: &[PolicyContainer],
    ) -> Result<String, ContainersError> {
        let rendered = serde_json::to_string_pretty(containers)?;
        let mut out = String::with_capacity(text.len() + rendered.len());
        out.push_str(&text[..self.span.start]);
        out.push_str(ASSIGNMENT);
        out.push_str(&rendered);
        out.push_str(&text[self.span.end..]);
        Ok(out)
    }
}

/// Locate and parse the containers block of `text`.
pub fn extract_containers(text: &str) -> Result<ContainersSpan, ContainersError> {
    let mut offset = 0;
    let mut open: Option<(usize, usize)> = None;

    for (line_no, line) in text.split_inclusive('\n').enumerate() {
        let content = line.trim_end();
        match open {
            None if content == CONTAINERS_MARKER => open = Some((line_no, offset)),
            Some((_, start)) if content == CONTAINERS_CLOSE => {
                let end = offset + content.len();
                // JSON runs from the marker's '[' through the closing ']'.
                let json_start = start + ASSIGNMENT.len();
                let entries: Vec<PolicyContainer> =
                    serde_json::from_str(&text[json_start..end])?;
                for (index, c) in entries.iter().enumerate() {
                    if c.layers().is_none() {
                        return Err(ContainersError::MissingLayers { index });
                    }
                }
                return Ok(ContainersSpan {
                    span: start..end,
                    containers: entries,
                });
            }
            _ => {}
        }
        offset += line.len();
    }

    match open {
        Some((line_no, _)) => Err(ContainersError::Unterminated(line_no + 1)),
        None => Err(ContainersError::MarkerNotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = "package policy\n\napi_svn := \"0.10.0\"\n\ncontainers := [\n  {\n    \"id\": \"pause\",\n    \"layers\": [\n      \"aaa\"\n    ],\n    \"name\": \"c0\"\n  }\n]\n\nallow_properties_access := true\n";

    #[test]
    fn extracts_single_block() {
        let s = extract_containers(POLICY).unwrap();
        assert_eq!(s.containers.len(), 1);
        assert_eq!(s.containers[0].id(), Some("pause"));
        assert_eq!(s.containers[0].layers(), Some(vec!["aaa"]));
        assert!(POLICY[s.span.clone()].starts_with(CONTAINERS_MARKER));
        assert!(POLICY[s.span.clone()].ends_with(']'));
    }

    #[test]
    fn splice_keeps_surrounding_bytes_and_field_order() {
        let s = extract_containers(POLICY).unwrap();
        let mut containers = s.containers.clone();
        containers[0].set_layers(&["bbb".into(), "ccc".into()]);
        let out = s.splice(POLICY, &containers).unwrap();

        assert_eq!(&out[..s.span.start], &POLICY[..s.span.start]);
        assert!(out.ends_with("\n]\n\nallow_properties_access := true\n"));
        let id = out.find("\"id\"").unwrap();
        let layers = out.find("\"layers\"").unwrap();
        let name = out.find("\"name\"").unwrap();
        assert!(id < layers && layers < name);
        assert!(out.contains("\"bbb\",\n      \"ccc\""));
    }

    #[test]
    fn unchanged_containers_round_trip_exactly() {
        let s = extract_containers(POLICY).unwrap();
        assert_eq!(s.splice(POLICY, &s.containers).unwrap(), POLICY);
    }

    #[test]
    fn tolerates_crlf_and_trailing_spaces() {
        let text = "x := 1\r\ncontainers := [  \r\n  {\"id\": \"a\", \"layers\": []}\r\n]\r\ny := 2\r\n";
        let s = extract_containers(text).unwrap();
        assert_eq!(s.containers.len(), 1);
        assert!(text[s.span.end..].starts_with("\r\ny := 2"));
    }

    #[test]
    fn missing_marker() {
        assert!(matches!(
            extract_containers("package policy\ncontainers = []\n"),
            Err(ContainersError::MarkerNotFound)
        ));
    }

    #[test]
    fn unterminated_block() {
        let err = extract_containers("a\ncontainers := [\n  {}\n  ]\n").unwrap_err();
        assert!(matches!(err, ContainersError::Unterminated(2)));
    }

    #[test]
    fn malformed_entries() {
        assert!(matches!(
            extract_containers("containers := [\n  {\"id\": \"x\"}\n]\n"),
            Err(ContainersError::MissingLayers { index: 0 })
        ));
        assert!(matches!(
            extract_containers("containers := [\n  {\"id\": \n]\n"),
            Err(ContainersError::InvalidJson(_))
        ));
        let mapped: CleanroomError = ContainersError::MarkerNotFound.into();
        assert!(matches!(mapped, CleanroomError::PolicyMismatch(_)));
    }
}
