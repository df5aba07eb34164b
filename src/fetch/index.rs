//! Sidecar index parsing and the pure matching/consolidation logic.
//!
//! An index is newline-delimited JSON, one object per message in the data
//! file:
//!
//! ```text
//! {"domain": "g", "date": "20240307", "time": "0000", "step": "3", "param": "2t", "_offset": 0, "_length": 609069}
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use thiserror::Error;

use crate::remote::ByteRange;
use crate::request::RequestDescriptor;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexParseError {
    #[error("Line {line}: not a JSON object: {reason}")]
    NotAnObject { line: usize, reason: String },

    #[error("Line {line}: missing or invalid '{field}'")]
    MissingField { line: usize, field: &'static str },
}

/// One index entry: the dimension values it describes and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub fields: BTreeMap<String, String>,
    pub range: ByteRange,
}

pub fn parse_index(text: &str) -> Result<Vec<IndexRecord>, IndexParseError> {
    let mut records = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line = i + 1;
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let object = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(IndexParseError::NotAnObject {
                    line,
                    reason: format!("found {}", other),
                })
            }
            Err(e) => {
                return Err(IndexParseError::NotAnObject {
                    line,
                    reason: e.to_string(),
                })
            }
        };

        let offset = object
            .get("_offset")
            .and_then(Value::as_u64)
            .ok_or(IndexParseError::MissingField {
                line,
                field: "_offset",
            })?;
        let length = object
            .get("_length")
            .and_then(Value::as_u64)
            .ok_or(IndexParseError::MissingField {
                line,
                field: "_length",
            })?;

        let fields = object
            .into_iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                Value::Number(n) => Some((k, n.to_string())),
                _ => None,
            })
            .collect();

        records.push(IndexRecord {
            fields,
            range: ByteRange::new(offset, length),
        });
    }
    Ok(records)
}

/// Whether the record's tuple is a point of the selector's product: every
/// selector dimension is present on the record with one of the requested
/// values.
pub fn matches(record: &IndexRecord, selector: &RequestDescriptor) -> bool {
    selector.dimensions().iter().all(|dim| {
        record
            .fields
            .get(&dim.name)
            .is_some_and(|v| dim.values.contains(v))
    })
}

/// A requested dimension value that no index record carried.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NoCoverage {
    pub dimension: String,
    pub value: String,
}

/// Values observed per selector dimension across every index read in one
/// fetch.
#[derive(Debug, Default)]
pub struct Coverage {
    observed: BTreeMap<String, BTreeSet<String>>,
}

impl Coverage {
    pub fn observe(&mut self, record: &IndexRecord, selector: &RequestDescriptor) {
        for dim in selector.dimensions() {
            if let Some(v) = record.fields.get(&dim.name) {
                self.observed
                    .entry(dim.name.clone())
                    .or_default()
                    .insert(v.clone());
            }
        }
    }

    pub fn missing(&self, selector: &RequestDescriptor) -> Vec<NoCoverage> {
        let empty = BTreeSet::new();
        let mut out = Vec::new();
        for dim in selector.dimensions() {
            let seen = self.observed.get(&dim.name).unwrap_or(&empty);
            for value in &dim.values {
                if !seen.contains(value) {
                    out.push(NoCoverage {
                        dimension: dim.name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        out
    }

    /// Values seen for a dimension, used to suggest alternatives in logs.
    pub fn observed(&self, dimension: &str) -> Vec<&str> {
        self.observed
            .get(dimension)
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// Sort ranges by offset and merge those that touch or overlap.
pub fn consolidate(mut ranges: Vec<ByteRange>) -> Vec<ByteRange> {
    // An empty range has no valid `Range` header.
    ranges.retain(|r| r.length > 0);
    ranges.sort();
    let mut out: Vec<ByteRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match out.last_mut() {
            Some(last) if r.offset <= last.end() => {
                let end = last.end().max(r.end());
                last.length = end - last.offset;
            }
            _ => out.push(r),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"{"param": "2t", "levtype": "sfc", "step": "0", "_offset": 0, "_length": 10}
{"param": "2t", "levtype": "sfc", "step": "3", "_offset": 10, "_length": 10}

{"param": "tp", "levtype": "sfc", "step": 0, "_offset": 20, "_length": 5}
"#;

    fn selector(param: &[&str]) -> RequestDescriptor {
        RequestDescriptor::new([("param", param.to_vec())]).unwrap()
    }

    #[test]
    fn test_parse_skips_blank_lines_and_stringifies_numbers() {
        let records = parse_index(INDEX).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].fields["step"], "0");
        assert_eq!(records[2].range, ByteRange::new(20, 5));
        assert!(!records[0].fields.contains_key("_offset"));
    }

    #[test]
    fn test_parse_rejects_missing_offset() {
        let err = parse_index(r#"{"param": "2t", "_length": 4}"#).unwrap_err();
        assert_eq!(
            err,
            IndexParseError::MissingField {
                line: 1,
                field: "_offset"
            }
        );
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(matches!(
            parse_index("[1, 2]"),
            Err(IndexParseError::NotAnObject { line: 1, .. })
        ));
        assert!(matches!(
            parse_index("{\"_offset\": 0, \"_length\": 1}\nnot json"),
            Err(IndexParseError::NotAnObject { line: 2, .. })
        ));
    }

    #[test]
    fn test_match_requires_every_selector_dimension() {
        let records = parse_index(INDEX).unwrap();
        let sel = RequestDescriptor::new([("param", vec!["2t"]), ("step", vec!["3"])]).unwrap();
        let hits: Vec<_> = records.iter().filter(|r| matches(r, &sel)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].range, ByteRange::new(10, 10));

        let absent_dim = RequestDescriptor::new([("levelist", ["500"])]).unwrap();
        assert!(records.iter().all(|r| !matches(r, &absent_dim)));
    }

    #[test]
    fn test_coverage_reports_unseen_values() {
        let records = parse_index(INDEX).unwrap();
        let sel = selector(&["2t", "msl"]);
        let mut coverage = Coverage::default();
        for r in &records {
            coverage.observe(r, &sel);
        }
        assert_eq!(
            coverage.missing(&sel),
            vec![NoCoverage {
                dimension: "param".into(),
                value: "msl".into()
            }]
        );
        assert_eq!(coverage.observed("param"), ["2t", "tp"]);
    }

    #[test]
    fn test_consolidate_merges_adjacent_and_overlapping() {
        let merged = consolidate(vec![
            ByteRange::new(20, 5),
            ByteRange::new(0, 10),
            ByteRange::new(10, 10),
            ByteRange::new(40, 10),
            ByteRange::new(45, 2),
        ]);
        assert_eq!(merged, vec![ByteRange::new(0, 25), ByteRange::new(40, 10)]);
    }

    #[test]
    fn test_consolidate_keeps_gaps() {
        let merged = consolidate(vec![ByteRange::new(20, 10), ByteRange::new(0, 10)]);
        assert_eq!(merged, vec![ByteRange::new(0, 10), ByteRange::new(20, 10)]);
    }

    #[test]
    fn test_consolidate_drops_empty_ranges() {
        let merged = consolidate(vec![
            ByteRange::new(30, 0),
            ByteRange::new(0, 10),
            ByteRange::new(5, 0),
        ]);
        assert_eq!(merged, vec![ByteRange::new(0, 10)]);
        assert!(consolidate(vec![ByteRange::new(7, 0)]).is_empty());
    }
}
