//! Telemetry blocks interleaved with the agent's structured output.
//!
//! The CLI's metrics exporter dumps multi-line blocks in JavaScript object
//! notation (bare keys, single quotes, trailing commas) onto the same stdout
//! as the JSON records. Those lines are pulled out by the classifier and
//! parsed here, best effort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::classifier::LineClassifier;
use crate::error::{Result, StreamError};

/// Field labels only a telemetry block contains
pub const TELEMETRY_MARKERS: &[&str] = &[
    "descriptor",
    "dataPointType",
    "dataPoints",
    "aggregationTemporality",
    "instrumentationScope",
];

/// Whether `line` mentions one of the telemetry field labels anywhere.
///
/// Plain substring match: ordinary output that happens to contain a label
/// (prose, tool results) is taken for telemetry too.
pub fn has_telemetry_marker(line: &str) -> bool {
    TELEMETRY_MARKERS.iter().any(|marker| line.contains(marker))
}

/// One parsed telemetry block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub data: Value,
}

impl TelemetryRecord {
    /// Parse a captured block, returning `None` when it cannot be repaired
    pub fn parse(block: &str, captured_at: DateTime<Utc>) -> Option<Self> {
        let trimmed = block.trim();
        if trimmed.is_empty() {
            return None;
        }

        // Blocks entered on a marker line have no opening brace of their own
        let source = if trimmed.starts_with('{') {
            trimmed.to_string()
        } else {
            format!("{{\n{}", trimmed)
        };

        match serde_json::from_str::<Value>(&relaxed_to_json(&source)) {
            Ok(data) => {
                let name = data
                    .pointer("/descriptor/name")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some(Self {
                    captured_at,
                    name,
                    data,
                })
            }
            Err(e) => {
                debug!("Dropping unparseable telemetry block: {}", e);
                None
            }
        }
    }

    /// Re-serialize in the multi-line form the exporter prints
    pub fn to_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.data).unwrap_or_default()
    }
}

/// Pulls telemetry records out of captured agent output.
pub struct TelemetryExtractor;

impl TelemetryExtractor {
    /// Run the line classifier over `text` and parse every block it captured
    pub fn extract(text: &str) -> Vec<TelemetryRecord> {
        let mut classifier = LineClassifier::new();
        for line in text.lines() {
            classifier.classify(line);
        }
        Self::parse_blocks(&classifier.take_telemetry_blocks(), Utc::now())
    }

    pub fn parse_blocks(blocks: &[String], captured_at: DateTime<Utc>) -> Vec<TelemetryRecord> {
        blocks
            .iter()
            .filter_map(|block| TelemetryRecord::parse(block, captured_at))
            .collect()
    }
}

/// Convert JavaScript object notation into strict JSON.
///
/// Bare keys and single-quoted strings get double quotes, trailing commas go
/// away and `undefined` becomes `null`. Other bare words (`[Object]` and the
/// like) become strings. Strict JSON passes through unchanged.
pub fn relaxed_to_json(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + input.len() / 4);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => i = copy_string(&chars, i, &mut out),
            ',' => {
                if !matches!(next_significant(&chars, i + 1), Some('}') | Some(']')) {
                    out.push(',');
                }
                i += 1;
            }
            '-' | '0'..='9' => {
                let end = scan(&chars, i + 1, |c| {
                    c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-')
                });
                out.extend(&chars[i..end]);
                i = end;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let end = scan(&chars, i, |c| c.is_alphanumeric() || c == '_' || c == '$');
                let word: String = chars[i..end].iter().collect();
                if next_significant(&chars, end) == Some(':') {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    match word.as_str() {
                        "true" | "false" | "null" => out.push_str(&word),
                        "undefined" | "NaN" | "Infinity" => out.push_str("null"),
                        _ => {
                            out.push('"');
                            out.push_str(&word);
                            out.push('"');
                        }
                    }
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Copy a quoted string starting at `start` as a double-quoted JSON string
fn copy_string(chars: &[char], start: usize, out: &mut String) -> usize {
    let quote = chars[start];
    out.push('"');
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' if i + 1 < chars.len() => {
                let escaped = chars[i + 1];
                if escaped == '\'' {
                    out.push('\'');
                } else {
                    out.push('\\');
                    out.push(escaped);
                }
                i += 2;
            }
            c if c == quote => {
                out.push('"');
                return i + 1;
            }
            '"' => {
                out.push_str("\\\"");
                i += 1;
            }
            '\n' => {
                out.push_str("\\n");
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    out.push('"');
    i
}

fn scan(chars: &[char], from: usize, keep: impl Fn(char) -> bool) -> usize {
    let mut end = from;
    while end < chars.len() && keep(chars[end]) {
        end += 1;
    }
    end
}

fn next_significant(chars: &[char], from: usize) -> Option<char> {
    chars[from.min(chars.len())..]
        .iter()
        .copied()
        .find(|c| !c.is_whitespace())
}

/// Append-only JSON-lines sink for telemetry records
#[derive(Clone, Debug)]
pub struct TelemetryLog {
    path: PathBuf,
}

impl TelemetryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line per record, creating the log's directory on first use
    pub async fn append(&self, records: &[TelemetryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let io_err = |source| StreamError::TelemetryLog {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&serde_json::to_string(record)?);
            buffer.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(buffer.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const EXPORTER_BLOCK: &str = r#"{
  descriptor: {
    name: 'claude_code.cost.usage',
    type: 'COUNTER',
    description: "Cost of the session's requests",
    unit: 'USD',
    valueType: 1,
    advice: {},
  },
  dataPointType: 3,
  dataPoints: [
    {
      attributes: [Object],
      startTime: [ 1759432134, 521000000 ],
      value: 0.0123,
      exemplar: undefined,
    }
  ]
}"#;

    #[test]
    fn converts_exporter_notation() {
        let value: Value = serde_json::from_str(&relaxed_to_json(EXPORTER_BLOCK)).unwrap();
        assert_eq!(value["descriptor"]["name"], "claude_code.cost.usage");
        assert_eq!(value["descriptor"]["description"], "Cost of the session's requests");
        assert_eq!(value["dataPointType"], 3);
        assert_eq!(value["dataPoints"][0]["attributes"], json!(["Object"]));
        assert_eq!(value["dataPoints"][0]["exemplar"], Value::Null);
        assert_eq!(value["dataPoints"][0]["value"], 0.0123);
    }

    #[test]
    fn strict_json_is_unchanged() {
        let strict = r#"{"a": [1, -2.5e3, true, null], "b": {"c": "it's \"quoted\""}}"#;
        assert_eq!(relaxed_to_json(strict), strict);
    }

    #[test]
    fn single_quotes_with_embedded_double_quotes() {
        let converted = relaxed_to_json(r#"{ label: 'say "hi"', other: 'it\'s' }"#);
        let value: Value = serde_json::from_str(&converted).unwrap();
        assert_eq!(value["label"], "say \"hi\"");
        assert_eq!(value["other"], "it's");
    }

    #[test]
    fn marker_detection() {
        assert!(has_telemetry_marker("  descriptor: {"));
        assert!(has_telemetry_marker(r#"  "dataPoints": ["#));
        assert!(has_telemetry_marker("dataPointType : 3,"));
        assert!(!has_telemetry_marker("  name: 'claude_code.cost.usage',"));
        assert!(!has_telemetry_marker(r#"{"type":"result","subtype":"success"}"#));
    }

    #[test]
    fn marker_detection_misfires_on_ordinary_text() {
        // Known false positives of the substring match
        assert!(has_telemetry_marker("the descriptor was lost"));
        assert!(has_telemetry_marker("  mydescriptor: {"));
        assert!(has_telemetry_marker(r#"{"text":"\"descriptor\": x"}"#));
    }

    #[test]
    fn extract_reads_every_block() {
        let text = format!(
            "{}\n{}\n{}\n",
            EXPORTER_BLOCK,
            r#"{"type":"result","subtype":"success"}"#,
            EXPORTER_BLOCK.replace("0.0123", "0.5")
        );
        let records = TelemetryExtractor::extract(&text);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name.as_deref(), Some("claude_code.cost.usage"));
        assert_eq!(records[1].data["dataPoints"][0]["value"], 0.5);
    }

    #[test]
    fn extraction_is_idempotent() {
        let first = TelemetryExtractor::extract(EXPORTER_BLOCK);
        assert_eq!(first.len(), 1);

        let reserialized: Vec<String> = first.iter().map(TelemetryRecord::to_pretty).collect();
        let second = TelemetryExtractor::extract(&reserialized.join("\n"));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].data, first[0].data);
    }

    #[test]
    fn garbage_blocks_are_dropped() {
        assert!(TelemetryRecord::parse("descriptor: {{{", Utc::now()).is_none());
        assert!(TelemetryRecord::parse("   ", Utc::now()).is_none());
    }

    #[tokio::test]
    async fn log_creates_directory_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = TelemetryLog::new(dir.path().join("nested/telemetry.jsonl"));
        let records = TelemetryExtractor::extract(EXPORTER_BLOCK);

        log.append(&records).await.unwrap();
        log.append(&records).await.unwrap();
        log.append(&[]).await.unwrap();

        let written = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: TelemetryRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.name.as_deref(), Some("claude_code.cost.usage"));
    }
}
